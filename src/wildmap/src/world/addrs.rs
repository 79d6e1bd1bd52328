//! Fast plausible address predicate

use crate::config::AddressModel;
use crate::maps::Range;
use crate::source::AddressValidator;

/// Sorted set of known address regions with small gaps merged
#[derive(Debug, Clone, Default)]
pub struct AddressSet {
    starts: Vec<u64>,
    ends: Vec<u64>,
    model: AddressModel,
}

impl AddressSet {
    /// Build from bounded ranges, gaps up to `granularity` bytes are closed
    pub fn new(ranges: impl IntoIterator<Item = Range>, model: AddressModel, granularity: u64) -> Self {
        let mut regs: Vec<(u64, u64)> = ranges
            .into_iter()
            .filter_map(|r| Some((r.lo()?, r.hi()?)))
            .collect();
        regs.sort_unstable();

        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(regs.len());
        for (lo, hi) in regs {
            match merged.last_mut() {
                Some(last) if last.1.saturating_add(granularity) >= lo => {
                    last.1 = last.1.max(hi);
                }
                _ => merged.push((lo, hi)),
            }
        }

        Self {
            starts: merged.iter().map(|r| r.0).collect(),
            ends: merged.iter().map(|r| r.1).collect(),
            model,
        }
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    pub fn bytes(&self) -> u64 {
        self.iter().map(|(lo, hi)| hi - lo).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.starts.iter().copied().zip(self.ends.iter().copied())
    }

    fn known(&self, address: u64) -> bool {
        let z = self.starts.partition_point(|&s| s <= address);
        z > 0 && address < self.ends[z - 1]
    }
}

fn is_canonical(address: u64) -> bool {
    !(0x0000_8000_0000_0000..0xffff_8000_0000_0000).contains(&address)
}

impl AddressValidator for AddressSet {
    fn is_plausible(&self, address: u64) -> bool {
        match self.model {
            AddressModel::Basic => self.known(address),
            AddressModel::Amd64 => is_canonical(address) && self.known(address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(lo: u64, hi: u64) -> Range {
        Range::bounded(lo, hi).unwrap()
    }

    #[test]
    fn test_gaps_merged() {
        let set = AddressSet::new(
            vec![b(0x3000, 0x4000), b(0x1000, 0x2000), b(0x2100, 0x2800)],
            AddressModel::Basic,
            0x100,
        );
        assert_eq!(set.len(), 2);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(0x1000, 0x2800), (0x3000, 0x4000)]);
        assert_eq!(set.bytes(), 0x1800 + 0x1000);

        assert!(set.is_plausible(0x1000));
        assert!(set.is_plausible(0x2050));
        assert!(!set.is_plausible(0x2800));
        assert!(!set.is_plausible(0xfff));
        assert!(set.is_plausible(0x3fff));
        assert!(!set.is_plausible(0x4000));
    }

    #[test]
    fn test_unbounded_ranges_skipped() {
        let set = AddressSet::new(vec![Range::WILD, b(0x10, 0x20)], AddressModel::Basic, 0);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_amd64_canonical() {
        let set = AddressSet::new(
            vec![b(0x7fff_0000_0000, 0x7fff_f000_0000), b(0x0000_8000_0000_0000, 0x0000_8000_0001_0000)],
            AddressModel::Amd64,
            0,
        );
        assert!(set.is_plausible(0x7fff_0000_1000));
        assert!(!set.is_plausible(0x0000_8000_0000_0010));

        let basic = AddressSet::new(
            vec![b(0x0000_8000_0000_0000, 0x0000_8000_0001_0000)],
            AddressModel::Basic,
            0,
        );
        assert!(basic.is_plausible(0x0000_8000_0000_0010));
    }
}
