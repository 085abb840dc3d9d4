// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The allocation policy ladder (spec §4.2).

/// Where new extents may be placed, in order of increasing freedom.
/// `alloc_lv_segment` walks this ladder starting at the requested
/// policy and falls through to looser policies only when
/// `CoreContext::maximise_cling` allows a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AllocPolicy {
    /// Defer to `CoreContext::default_policy`.
    Inherit,
    /// Extend must land on the PV already holding the LV's last extent,
    /// immediately following it.
    Contiguous,
    /// Prefer a PV already used by the LV, adjacent to an existing
    /// extent of the same LV where possible.
    Cling,
    /// As `Cling`, but PVs sharing a tag with one already in use also
    /// count as "already used".
    ClingByTags,
    /// Any PV with free space, but spread parallel areas (stripes,
    /// mirror images, raid images) across distinct PVs where possible.
    Normal,
    /// Any PV with free space; parallel areas may share a PV.
    Anywhere,
}

impl AllocPolicy {
    /// The next looser policy to retry with, or `None` if `self` is
    /// already the loosest (`Anywhere`) or is `Inherit` (never retried
    /// directly; it is resolved to a concrete policy first).
    pub fn next_looser(self) -> Option<AllocPolicy> {
        match self {
            AllocPolicy::Inherit => None,
            AllocPolicy::Contiguous => Some(AllocPolicy::Cling),
            AllocPolicy::Cling => Some(AllocPolicy::ClingByTags),
            AllocPolicy::ClingByTags => Some(AllocPolicy::Normal),
            AllocPolicy::Normal => Some(AllocPolicy::Anywhere),
            AllocPolicy::Anywhere => None,
        }
    }

    /// Whether this policy permits a parallel area (stripe, mirror
    /// image, raid image) to land on a PV already used by another area
    /// of the same segment.
    pub fn allows_shared_pv_across_areas(self) -> bool {
        matches!(self, AllocPolicy::Anywhere)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_descends_to_anywhere() {
        let mut p = AllocPolicy::Contiguous;
        let mut seen = vec![p];
        while let Some(next) = p.next_looser() {
            seen.push(next);
            p = next;
        }
        assert_eq!(
            seen,
            vec![
                AllocPolicy::Contiguous,
                AllocPolicy::Cling,
                AllocPolicy::ClingByTags,
                AllocPolicy::Normal,
                AllocPolicy::Anywhere,
            ]
        );
    }

    #[test]
    fn anywhere_allows_shared_pv() {
        assert!(AllocPolicy::Anywhere.allows_shared_pv_across_areas());
        assert!(!AllocPolicy::Normal.allows_shared_pv_across_areas());
    }
}
