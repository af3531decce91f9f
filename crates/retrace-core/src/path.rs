use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::ops::Index;

/// An ordered sequence of IPv4 addresses representing network hops.
///
/// Index 0 is the origin and the final index is the terminus.  Two paths are
/// equal iff they are element-wise equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Path(Vec<Ipv4Addr>);

impl Path {
    #[must_use]
    pub fn new(hops: Vec<Ipv4Addr>) -> Self {
        Self(hops)
    }

    /// The hops of this path.
    #[must_use]
    pub fn hops(&self) -> &[Ipv4Addr] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn first(&self) -> Option<Ipv4Addr> {
        self.0.first().copied()
    }

    #[must_use]
    pub fn last(&self) -> Option<Ipv4Addr> {
        self.0.last().copied()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<Ipv4Addr> {
        self.0.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.0.iter().copied()
    }

    /// The minimal prefix of this path ending at `last_hop`, or an empty path
    /// if `last_hop` is not present.
    #[must_use]
    pub fn subpath(&self, last_hop: Ipv4Addr) -> Self {
        self.0
            .iter()
            .position(|hop| *hop == last_hop)
            .map_or_else(Self::default, |index| Self(self.0[..=index].to_vec()))
    }

    /// The prefix holding the first `len` hops.
    #[must_use]
    pub fn prefix(&self, len: usize) -> Self {
        Self(self.0[..len.min(self.0.len())].to_vec())
    }
}

impl From<Vec<Ipv4Addr>> for Path {
    fn from(hops: Vec<Ipv4Addr>) -> Self {
        Self(hops)
    }
}

impl FromIterator<Ipv4Addr> for Path {
    fn from_iter<T: IntoIterator<Item = Ipv4Addr>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Index<usize> for Path {
    type Output = Ipv4Addr;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl Display for Path {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use itertools::Itertools as _;
        write!(f, "{}", self.0.iter().format(" -> "))
    }
}
