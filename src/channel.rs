//! Measurement channels carried by raw and hourly rows.
//!
//! Raw channels are the columns delivered by the station API and file
//! exports. Derived channels only exist on the hourly table.

use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    Rain,
    WsMax,
    WdMax,
    Ws,
    Wd,
    StdWd,
    Td,
    Rh,
    TdMax,
    TdMin,
    Ws1mm,
    Ws10mm,
    UVec,
    VVec,
    RainIntensityMax,
}

impl Channel {
    pub const COUNT: usize = 15;

    /// Channels that can appear in the raw table, in column order.
    pub const RAW: [Channel; 12] = [
        Channel::Rain,
        Channel::WsMax,
        Channel::WdMax,
        Channel::Ws,
        Channel::Wd,
        Channel::StdWd,
        Channel::Td,
        Channel::Rh,
        Channel::TdMax,
        Channel::TdMin,
        Channel::Ws1mm,
        Channel::Ws10mm,
    ];

    pub const ALL: [Channel; Channel::COUNT] = [
        Channel::Rain,
        Channel::WsMax,
        Channel::WdMax,
        Channel::Ws,
        Channel::Wd,
        Channel::StdWd,
        Channel::Td,
        Channel::Rh,
        Channel::TdMax,
        Channel::TdMin,
        Channel::Ws1mm,
        Channel::Ws10mm,
        Channel::UVec,
        Channel::VVec,
        Channel::RainIntensityMax,
    ];

    pub fn column(self) -> &'static str {
        match self {
            Channel::Rain => "rain",
            Channel::WsMax => "wsmax",
            Channel::WdMax => "wdmax",
            Channel::Ws => "ws",
            Channel::Wd => "wd",
            Channel::StdWd => "stdwd",
            Channel::Td => "td",
            Channel::Rh => "rh",
            Channel::TdMax => "tdmax",
            Channel::TdMin => "tdmin",
            Channel::Ws1mm => "ws1mm",
            Channel::Ws10mm => "ws10mm",
            Channel::UVec => "u_vec",
            Channel::VVec => "v_vec",
            Channel::RainIntensityMax => "rain_intensity_max",
        }
    }

    /// Look up a raw channel by its normalized column name.
    pub fn from_raw_column(name: &str) -> Option<Channel> {
        Channel::RAW.into_iter().find(|c| c.column() == name)
    }

    pub fn is_derived(self) -> bool {
        matches!(
            self,
            Channel::UVec | Channel::VVec | Channel::RainIntensityMax
        )
    }

    /// Hourly reducer for this channel.
    ///
    /// `Wd` has none: direction only reaches the hourly table through the
    /// wind vector components.
    pub fn reducer(self) -> Option<Reducer> {
        match self {
            Channel::Rain => Some(Reducer::Sum),
            Channel::WsMax
            | Channel::WdMax
            | Channel::TdMax
            | Channel::Ws1mm
            | Channel::Ws10mm
            | Channel::RainIntensityMax => Some(Reducer::Max),
            Channel::TdMin => Some(Reducer::Min),
            Channel::Ws
            | Channel::StdWd
            | Channel::Td
            | Channel::Rh
            | Channel::UVec
            | Channel::VVec => Some(Reducer::Mean),
            Channel::Wd => None,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reducer {
    Sum,
    Max,
    Min,
    Mean,
}

impl Reducer {
    /// Reduce the non-missing values of one bucket. Returns `None` when the
    /// bucket holds no values for the channel.
    pub fn apply<I>(self, values: I) -> Option<f64>
    where
        I: IntoIterator<Item = f64>,
    {
        let mut count = 0usize;
        let mut acc = 0.0f64;

        for value in values {
            acc = match (self, count) {
                (_, 0) => value,
                (Reducer::Sum | Reducer::Mean, _) => acc + value,
                (Reducer::Max, _) => acc.max(value),
                (Reducer::Min, _) => acc.min(value),
            };
            count += 1;
        }

        match (self, count) {
            (_, 0) => None,
            (Reducer::Mean, n) => Some(acc / n as f64),
            _ => Some(acc),
        }
    }
}

/// Fixed-size bag of optional channel values, indexed by [`Channel`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChannelValues([Option<f64>; Channel::COUNT]);

impl ChannelValues {
    pub fn get(&self, channel: Channel) -> Option<f64> {
        self.0[channel.index()]
    }

    /// Store a value. Non-finite values are stored as missing.
    pub fn set(&mut self, channel: Channel, value: Option<f64>) {
        self.0[channel.index()] = value.filter(|v| v.is_finite());
    }

    pub fn with(mut self, channel: Channel, value: f64) -> Self {
        self.set(channel, Some(value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }
}

/// The set of channels present in a table schema.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelSet(BTreeSet<Channel>);

impl ChannelSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn all_raw() -> Self {
        Channel::RAW.into_iter().collect()
    }

    /// Build the set from column names, ignoring anything that is not a raw
    /// channel column.
    pub fn from_columns<'a, I>(columns: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        columns
            .into_iter()
            .filter_map(Channel::from_raw_column)
            .collect()
    }

    pub fn insert(&mut self, channel: Channel) {
        self.0.insert(channel);
    }

    pub fn contains(&self, channel: Channel) -> bool {
        self.0.contains(&channel)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Channels in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = Channel> + '_ {
        self.0.iter().copied()
    }

    pub fn has_wind_vectors(&self) -> bool {
        self.contains(Channel::Ws) && self.contains(Channel::Wd)
    }

    /// Channels of the hourly table derived from this raw schema.
    pub fn hourly(&self) -> ChannelSet {
        let mut out: ChannelSet = self
            .iter()
            .filter(|c| !c.is_derived() && c.reducer().is_some())
            .collect();

        if self.has_wind_vectors() {
            out.insert(Channel::UVec);
            out.insert(Channel::VVec);
        }
        if self.contains(Channel::Rain) {
            out.insert(Channel::RainIntensityMax);
        }
        out
    }
}

impl FromIterator<Channel> for ChannelSet {
    fn from_iter<T: IntoIterator<Item = Channel>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
