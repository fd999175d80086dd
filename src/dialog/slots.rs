//! Booking slots: the fields the dialog must collect before a booking draft
//! can move to confirmation.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotName {
    ServiceType,
    Address,
    AppointmentTime,
    Phone,
    Name,
}

/// Fixed priority order the dialog asks for missing slots in.
pub const SLOT_PRIORITY: [SlotName; 5] = [
    SlotName::ServiceType,
    SlotName::Address,
    SlotName::AppointmentTime,
    SlotName::Phone,
    SlotName::Name,
];

impl SlotName {
    /// The follow-up question asked when this is the next missing slot.
    pub fn prompt(&self) -> &'static str {
        match self {
            SlotName::ServiceType => "What service would you like to book?",
            SlotName::Address => "What's the address for the appointment?",
            SlotName::AppointmentTime => "What day and time would you like?",
            SlotName::Phone => "What's the best phone number to reach you?",
            SlotName::Name => "And what name should I put the booking under?",
        }
    }
}

/// Partial or complete set of booking slots, as accumulated by the dialog
/// state machine. `None` means not yet collected.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Slots {
    pub service_type: Option<String>,
    pub address: Option<String>,
    pub appointment_time: Option<String>,
    pub phone: Option<String>,
    pub name: Option<String>,
}

impl Slots {
    pub fn get(&self, slot: SlotName) -> Option<&str> {
        match slot {
            SlotName::ServiceType => self.service_type.as_deref(),
            SlotName::Address => self.address.as_deref(),
            SlotName::AppointmentTime => self.appointment_time.as_deref(),
            SlotName::Phone => self.phone.as_deref(),
            SlotName::Name => self.name.as_deref(),
        }
    }

    pub fn set(&mut self, slot: SlotName, value: String) {
        match slot {
            SlotName::ServiceType => self.service_type = Some(value),
            SlotName::Address => self.address = Some(value),
            SlotName::AppointmentTime => self.appointment_time = Some(value),
            SlotName::Phone => self.phone = Some(value),
            SlotName::Name => self.name = Some(value),
        }
    }

    pub fn clear(&mut self, slot: SlotName) {
        match slot {
            SlotName::ServiceType => self.service_type = None,
            SlotName::Address => self.address = None,
            SlotName::AppointmentTime => self.appointment_time = None,
            SlotName::Phone => self.phone = None,
            SlotName::Name => self.name = None,
        }
    }

    /// The next missing mandatory slot, in fixed priority order, if any.
    pub fn next_missing(&self) -> Option<SlotName> {
        SLOT_PRIORITY.into_iter().find(|&s| self.get(s).is_none())
    }

    pub fn is_complete(&self) -> bool {
        self.next_missing().is_none()
    }

    /// Human-readable summary used in the confirmation turn.
    pub fn summary(&self) -> String {
        format!(
            "a {} at {} on {}, phone {}, under the name {}",
            self.service_type.as_deref().unwrap_or("service"),
            self.address.as_deref().unwrap_or("the provided address"),
            self.appointment_time.as_deref().unwrap_or("the requested time"),
            self.phone.as_deref().unwrap_or("the provided number"),
            self.name.as_deref().unwrap_or("the caller"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_slots_follow_fixed_priority() {
        let mut slots = Slots::default();
        assert_eq!(slots.next_missing(), Some(SlotName::ServiceType));
        slots.set(SlotName::ServiceType, "haircut".into());
        assert_eq!(slots.next_missing(), Some(SlotName::Address));
        slots.set(SlotName::Address, "123 Main St".into());
        assert_eq!(slots.next_missing(), Some(SlotName::AppointmentTime));
    }

    #[test]
    fn complete_when_all_mandatory_slots_present() {
        let mut slots = Slots::default();
        for (slot, value) in SLOT_PRIORITY.iter().zip(["a", "b", "c", "d", "e"]) {
            slots.set(*slot, value.into());
        }
        assert!(slots.is_complete());
        assert_eq!(slots.next_missing(), None);
    }

    #[test]
    fn clearing_a_slot_makes_it_missing_again() {
        let mut slots = Slots::default();
        for (slot, value) in SLOT_PRIORITY.iter().zip(["a", "b", "c", "d", "e"]) {
            slots.set(*slot, value.into());
        }
        slots.clear(SlotName::AppointmentTime);
        assert_eq!(slots.next_missing(), Some(SlotName::AppointmentTime));
    }
}
