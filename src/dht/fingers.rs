use crate::RingMember;

/// Shortcut pointers `1..bits`; finger `i` caches the owner of `id + 2^(i-1)`.
///
/// Finger 0 is the successor, which the node keeps next to its next successor.
#[derive(Debug, Clone, Default)]
pub struct FingerTable {
    entries: Vec<Option<RingMember>>,
}

impl FingerTable {
    pub fn new(bits: u32) -> Self {
        FingerTable {
            entries: vec![None; bits.saturating_sub(1) as usize],
        }
    }

    pub fn get(&self, index: u32) -> Option<&RingMember> {
        let slot = (index as usize).checked_sub(1)?;
        self.entries.get(slot)?.as_ref()
    }

    pub fn set(&mut self, index: u32, member: Option<RingMember>) {
        if let Some(entry) = (index as usize)
            .checked_sub(1)
            .and_then(|slot| self.entries.get_mut(slot))
        {
            *entry = member;
        }
    }

    /// Points every finger aimed at `dead` to `replacement`, returning how many moved.
    pub fn replace(&mut self, dead: &RingMember, replacement: &RingMember) -> usize {
        let mut moved = 0;
        for entry in self.entries.iter_mut().flatten() {
            if entry.address == dead.address {
                *entry = replacement.clone();
                moved += 1;
            }
        }
        moved
    }

    pub fn members(&self) -> impl Iterator<Item = &RingMember> {
        self.entries.iter().flatten()
    }

    pub fn entries(&self) -> &[Option<RingMember>] {
        &self.entries
    }
}
