//! Readiness policy: which slots must be filled before a VM may start.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::vm::slots::{Slot, SlotPaths};

/// The required subset of slots.
///
/// The kernel is always required; the configured set can only add to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Slot>", into = "Vec<Slot>")]
pub struct ReadinessPolicy {
    required: BTreeSet<Slot>,
}

impl ReadinessPolicy {
    pub fn new(required: impl IntoIterator<Item = Slot>) -> Self {
        let mut required: BTreeSet<Slot> = required.into_iter().collect();
        required.insert(Slot::Kernel);
        Self { required }
    }

    /// Kernel only.
    pub fn kernel_only() -> Self {
        Self::new([])
    }

    pub fn required(&self) -> impl Iterator<Item = Slot> + '_ {
        self.required.iter().copied()
    }

    /// Required slots that `slots` leaves empty.
    pub fn missing(&self, slots: &SlotPaths) -> Vec<Slot> {
        self.required
            .iter()
            .copied()
            .filter(|slot| !slots.contains(*slot))
            .collect()
    }

    pub fn is_ready(&self, slots: &SlotPaths) -> bool {
        self.required.iter().all(|slot| slots.contains(*slot))
    }
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self::kernel_only()
    }
}

impl From<Vec<Slot>> for ReadinessPolicy {
    fn from(required: Vec<Slot>) -> Self {
        Self::new(required)
    }
}

impl From<ReadinessPolicy> for Vec<Slot> {
    fn from(policy: ReadinessPolicy) -> Self {
        policy.required.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn slots_with(filled: &[Slot]) -> SlotPaths {
        let mut slots = SlotPaths::new();
        for slot in filled {
            slots.set(*slot, PathBuf::from(format!("/{slot}")));
        }
        slots
    }

    #[test]
    fn kernel_is_always_required() {
        let policy = ReadinessPolicy::new([Slot::Image]);
        let required: Vec<Slot> = policy.required().collect();
        assert_eq!(required, vec![Slot::Kernel, Slot::Image]);
    }

    #[test]
    fn empty_configuration_is_never_ready() {
        for policy in [
            ReadinessPolicy::kernel_only(),
            ReadinessPolicy::new([Slot::Initrd, Slot::Image]),
        ] {
            assert!(!policy.is_ready(&SlotPaths::new()));
        }
    }

    #[test]
    fn kernel_only_policy() {
        let policy = ReadinessPolicy::kernel_only();
        assert!(policy.is_ready(&slots_with(&[Slot::Kernel])));
        assert!(!policy.is_ready(&slots_with(&[Slot::Initrd, Slot::Image, Slot::Extra])));
    }

    #[test]
    fn every_superset_of_the_required_set_is_ready() {
        let policy = ReadinessPolicy::new([Slot::Initrd]);
        // Enumerate all 16 configurations.
        for mask in 0u8..16 {
            let filled: Vec<Slot> = Slot::ALL
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, s)| *s)
                .collect();
            let slots = slots_with(&filled);
            let expected = filled.contains(&Slot::Kernel) && filled.contains(&Slot::Initrd);
            assert_eq!(policy.is_ready(&slots), expected, "filled = {filled:?}");
            assert_eq!(policy.missing(&slots).is_empty(), expected);
        }
    }

    #[test]
    fn missing_lists_empty_required_slots() {
        let policy = ReadinessPolicy::new([Slot::Initrd, Slot::Image]);
        let slots = slots_with(&[Slot::Initrd]);
        assert_eq!(policy.missing(&slots), vec![Slot::Kernel, Slot::Image]);
    }

    #[test]
    fn deserializes_from_a_list_of_slot_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            required: ReadinessPolicy,
        }
        let parsed: Wrapper = toml::from_str(r#"required = ["image"]"#).unwrap();
        assert_eq!(parsed.required, ReadinessPolicy::new([Slot::Image]));
    }
}
