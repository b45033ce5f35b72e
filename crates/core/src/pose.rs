//! Avatar variants: the optional base image plus the fixed pose set.
//!
//! Each pose corresponds to one page of the app the avatars are drawn
//! for. The order of [`Pose::ALL`] is the order in which pose jobs are
//! generated for an avatar.

use std::fmt;
use std::str::FromStr;

/// Key used for the un-posed base image of an avatar.
pub const BASE_KEY: &str = "base";

/// One of the fixed scene poses an avatar is rendered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Pose {
    Home,
    Learn,
    Quiz,
    Progress,
    Options,
}

impl Pose {
    /// Every pose, in generation order.
    pub const ALL: [Pose; 5] = [
        Pose::Home,
        Pose::Learn,
        Pose::Quiz,
        Pose::Progress,
        Pose::Options,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Pose::Home => "home",
            Pose::Learn => "learn",
            Pose::Quiz => "quiz",
            Pose::Progress => "progress",
            Pose::Options => "options",
        }
    }
}

impl fmt::Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Pose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pose::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown pose '{s}'"))
    }
}

/// A single renderable variant of an avatar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Variant {
    /// Stand-alone portrait, stored as `{id}.png`.
    Base,
    /// Scene pose, stored as `{id}/{pose}.png`.
    Pose(Pose),
}

impl Variant {
    /// Base first, then every pose in generation order.
    pub fn all() -> impl Iterator<Item = Variant> {
        std::iter::once(Variant::Base).chain(Pose::ALL.into_iter().map(Variant::Pose))
    }

    /// The table key naming this variant (`"base"`, `"home"`, ...).
    pub fn key(self) -> &'static str {
        match self {
            Variant::Base => BASE_KEY,
            Variant::Pose(p) => p.as_str(),
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == BASE_KEY {
            Ok(Variant::Base)
        } else {
            s.parse().map(Variant::Pose)
        }
    }
}
