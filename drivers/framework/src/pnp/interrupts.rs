//! # Interrupt Bookkeeping
//!
//! Interrupt objects created by the driver carry an affinity policy. When the
//! resource requirements travel up the stack, [`filter_resource_requirements`]
//! walks every alternative list and stamps each interrupt descriptor with the
//! policy of the matching object:
//!
//! - line-based descriptors consume objects in creation order;
//! - message-signalled descriptors keep their own cursor over the same objects;
//! - an alternative descriptor reuses the object picked for its preferred one;
//! - a line-based alternative that follows message descriptors falls back to
//!   the first object.
//!
//! Descriptors that already carry a policy are left alone.

use bitflags::bitflags;

bitflags! {
    /// Descriptor option bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResourceOption: u8 {
        const PREFERRED   = 0x01;
        const DEFAULT     = 0x02;
        const ALTERNATIVE = 0x08;
    }
}

bitflags! {
    /// Interrupt descriptor flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InterruptFlags: u16 {
        const LATCHED         = 0x0001;
        const MESSAGE         = 0x0002;
        const POLICY_INCLUDED = 0x0004;
        const SECONDARY       = 0x0010;
        const WAKE_HINT       = 0x0020;
    }
}

/// Processor targeting policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AffinityPolicy {
    #[default]
    MachineDefault,
    AllCloseProcessors,
    OneCloseProcessor,
    AllProcessorsInMachine,
    SpecifiedProcessors,
    SpreadMessagesAcrossAllProcessors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterruptPriority {
    #[default]
    Undefined,
    Low,
    Normal,
    High,
}

/// Policy applied to a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterruptPolicy {
    pub policy: AffinityPolicy,
    pub priority: InterruptPriority,
    pub group: u16,
    pub affinity: u64,
}

/// Driver-created interrupt object
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Interrupt {
    pub name: String,
    pub policy: InterruptPolicy,
    pub wake_capable: bool,
}

impl Interrupt {
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            ..Self::default()
        }
    }

    pub fn with_policy(mut self, policy: InterruptPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_wake_capable(mut self, wake_capable: bool) -> Self {
        self.wake_capable = wake_capable;
        self
    }

    fn filter(&self, descriptor: &mut InterruptDescriptor) {
        if self.wake_capable {
            descriptor.flags.insert(InterruptFlags::WAKE_HINT);
        }

        if descriptor.flags.contains(InterruptFlags::POLICY_INCLUDED) {
            return;
        }

        descriptor.policy = Some(self.policy);
        descriptor.flags.insert(InterruptFlags::POLICY_INCLUDED);
    }
}

// =============================================================================
// REQUIREMENTS LIST
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InterruptDescriptor {
    pub option: ResourceOption,
    pub flags: InterruptFlags,
    pub minimum_vector: u32,
    pub maximum_vector: u32,
    pub policy: Option<InterruptPolicy>,
}

impl InterruptDescriptor {
    /// Line-based interrupt
    pub fn line(option: ResourceOption) -> Self {
        Self {
            option,
            ..Self::default()
        }
    }

    /// Message-signalled interrupt covering `messages` vectors
    pub fn message(option: ResourceOption, messages: u32) -> Self {
        Self {
            option,
            flags: InterruptFlags::MESSAGE,
            minimum_vector: 0,
            maximum_vector: messages.saturating_sub(1),
            policy: None,
        }
    }

    pub fn is_message(&self) -> bool {
        self.flags.contains(InterruptFlags::MESSAGE)
    }

    pub fn is_alternative(&self) -> bool {
        self.option.contains(ResourceOption::ALTERNATIVE)
    }

    pub fn message_count(&self) -> u32 {
        self.maximum_vector
            .saturating_sub(self.minimum_vector)
            .saturating_add(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceDescriptor {
    Interrupt(InterruptDescriptor),
    Port { option: ResourceOption, length: u32 },
    Memory { option: ResourceOption, length: u32 },
}

/// One alternative set of resources
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceList {
    pub descriptors: Vec<ResourceDescriptor>,
}

impl ResourceList {
    pub fn new(descriptors: Vec<ResourceDescriptor>) -> Self {
        Self { descriptors }
    }
}

/// Resource requirements with their alternative lists
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceRequirementsList {
    pub alternatives: Vec<ResourceList>,
}

impl ResourceRequirementsList {
    pub fn new(alternatives: Vec<ResourceList>) -> Self {
        Self { alternatives }
    }
}

/// Counters over a device's interrupt objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterruptCounts {
    pub total: usize,
    pub wake_capable: usize,
}

pub fn interrupt_counts(interrupts: &[Interrupt]) -> InterruptCounts {
    InterruptCounts {
        total: interrupts.len(),
        wake_capable: interrupts.iter().filter(|i| i.wake_capable).count(),
    }
}

/// Stamp interrupt descriptors in `list` with the policies of `interrupts`
pub fn filter_resource_requirements(interrupts: &[Interrupt], list: Option<&mut ResourceRequirementsList>) {
    let Some(list) = list else {
        return;
    };

    if interrupts.is_empty() {
        return;
    }

    for alternative in &mut list.alternatives {
        // Cursors are "one past" the object in use; 0 means none picked yet
        let mut msi_cursor = 0usize;
        let mut lbi_cursor = 0usize;
        let mut multi_message_found = false;
        let mut previous_message = false;

        for descriptor in &mut alternative.descriptors {
            let ResourceDescriptor::Interrupt(descriptor) = descriptor else {
                continue;
            };

            if descriptor.is_message() {
                previous_message = true;

                if !descriptor.is_alternative() {
                    msi_cursor += 1;
                }

                let Some(interrupt) = msi_cursor.checked_sub(1).and_then(|i| interrupts.get(i)) else {
                    log::warn!("PnpPackage: not enough interrupt objects for message interrupts");
                    continue;
                };

                if descriptor.message_count() > 1 && !descriptor.is_alternative() {
                    debug_assert!(!multi_message_found);
                    multi_message_found = true;
                }

                interrupt.filter(descriptor);
            } else {
                if !descriptor.is_alternative() {
                    lbi_cursor += 1;
                }

                if previous_message {
                    debug_assert!(descriptor.is_alternative());
                    lbi_cursor = 1;
                    previous_message = false;
                }

                let Some(interrupt) = lbi_cursor.checked_sub(1).and_then(|i| interrupts.get(i)) else {
                    log::warn!("PnpPackage: not enough interrupt objects for line-based interrupts");
                    continue;
                };

                interrupt.filter(descriptor);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(affinity: u64) -> InterruptPolicy {
        InterruptPolicy {
            policy: AffinityPolicy::SpecifiedProcessors,
            priority: InterruptPriority::High,
            group: 0,
            affinity,
        }
    }

    fn interrupt_at(list: &ResourceRequirementsList, alt: usize, index: usize) -> &InterruptDescriptor {
        match &list.alternatives[alt].descriptors[index] {
            ResourceDescriptor::Interrupt(descriptor) => descriptor,
            other => panic!("not an interrupt: {:?}", other),
        }
    }

    #[test]
    fn test_line_based_with_alternatives() {
        let interrupts = [
            Interrupt::new("first").with_policy(policy(0x1)),
            Interrupt::new("second").with_policy(policy(0x2)),
        ];
        let mut list = ResourceRequirementsList::new(vec![ResourceList::new(vec![
            ResourceDescriptor::Interrupt(InterruptDescriptor::line(ResourceOption::PREFERRED)),
            ResourceDescriptor::Interrupt(InterruptDescriptor::line(ResourceOption::ALTERNATIVE)),
            ResourceDescriptor::Memory {
                option: ResourceOption::empty(),
                length: 0x1000,
            },
            ResourceDescriptor::Interrupt(InterruptDescriptor::line(ResourceOption::PREFERRED)),
            ResourceDescriptor::Interrupt(InterruptDescriptor::line(ResourceOption::PREFERRED)),
        ])]);

        filter_resource_requirements(&interrupts, Some(&mut list));

        assert_eq!(interrupt_at(&list, 0, 0).policy, Some(policy(0x1)));
        assert_eq!(interrupt_at(&list, 0, 1).policy, Some(policy(0x1)));
        assert_eq!(interrupt_at(&list, 0, 3).policy, Some(policy(0x2)));
        // Ran out of objects
        assert_eq!(interrupt_at(&list, 0, 4).policy, None);
        assert!(!interrupt_at(&list, 0, 4).flags.contains(InterruptFlags::POLICY_INCLUDED));
    }

    #[test]
    fn test_message_then_line_alternative_uses_first_object() {
        let interrupts = [
            Interrupt::new("a").with_policy(policy(0x10)),
            Interrupt::new("b").with_policy(policy(0x20)),
        ];
        let mut list = ResourceRequirementsList::new(vec![ResourceList::new(vec![
            ResourceDescriptor::Interrupt(InterruptDescriptor::message(ResourceOption::PREFERRED, 1)),
            ResourceDescriptor::Interrupt(InterruptDescriptor::message(ResourceOption::PREFERRED, 1)),
            ResourceDescriptor::Interrupt(InterruptDescriptor::line(ResourceOption::ALTERNATIVE)),
        ])]);

        filter_resource_requirements(&interrupts, Some(&mut list));

        assert_eq!(interrupt_at(&list, 0, 0).policy, Some(policy(0x10)));
        assert_eq!(interrupt_at(&list, 0, 1).policy, Some(policy(0x20)));
        assert_eq!(interrupt_at(&list, 0, 2).policy, Some(policy(0x10)));
    }

    #[test]
    fn test_existing_policy_is_kept() {
        let interrupts = [Interrupt::new("a").with_policy(policy(0x1)).with_wake_capable(true)];
        let mut preset = InterruptDescriptor::line(ResourceOption::PREFERRED);
        preset.flags.insert(InterruptFlags::POLICY_INCLUDED);
        preset.policy = Some(policy(0xF0));

        let mut list = ResourceRequirementsList::new(vec![
            ResourceList::new(vec![ResourceDescriptor::Interrupt(preset)]),
            ResourceList::new(vec![ResourceDescriptor::Interrupt(InterruptDescriptor::line(
                ResourceOption::PREFERRED,
            ))]),
        ]);

        filter_resource_requirements(&interrupts, Some(&mut list));

        let kept = interrupt_at(&list, 0, 0);
        assert_eq!(kept.policy, Some(policy(0xF0)));
        assert!(kept.flags.contains(InterruptFlags::WAKE_HINT));
        // Cursors restart for each alternative list
        assert_eq!(interrupt_at(&list, 1, 0).policy, Some(policy(0x1)));
    }

    #[test]
    fn test_no_objects_leaves_list_untouched() {
        let original = ResourceRequirementsList::new(vec![ResourceList::new(vec![
            ResourceDescriptor::Interrupt(InterruptDescriptor::line(ResourceOption::PREFERRED)),
        ])]);
        let mut list = original.clone();
        filter_resource_requirements(&[], Some(&mut list));
        assert_eq!(list, original);
        filter_resource_requirements(&[Interrupt::new("a")], None);
    }

    #[test]
    fn test_counts() {
        let interrupts = [Interrupt::new("a").with_wake_capable(true), Interrupt::new("b")];
        assert_eq!(
            interrupt_counts(&interrupts),
            InterruptCounts {
                total: 2,
                wake_capable: 1
            }
        );
    }
}
