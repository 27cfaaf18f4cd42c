use std::collections::HashSet;

use relaybus_broker::DeliveryTag;

/// Maps publish sequence numbers of one batch to message ids and resolves
/// each of them at most once.
#[derive(Debug)]
pub struct ConfirmTracker {
    base: DeliveryTag,
    slots: Vec<Option<String>>,
    /// Every tag at or below this was swept by a cumulative signal.
    high_water: DeliveryTag,
    returned: HashSet<String>,
    outstanding: usize,
}

impl ConfirmTracker {
    /// `base` is the sequence number the first tracked message receives.
    pub fn new(base: DeliveryTag) -> Self {
        Self {
            base,
            slots: Vec::new(),
            high_water: base.saturating_sub(1),
            returned: HashSet::new(),
            outstanding: 0,
        }
    }

    /// Record the next published message. Returns its sequence number.
    pub fn track(&mut self, message_id: impl Into<String>) -> DeliveryTag {
        let tag = self.base + self.slots.len() as DeliveryTag;
        self.slots.push(Some(message_id.into()));
        self.outstanding += 1;
        tag
    }

    /// Remember an unroutable message. `false` if it was already known.
    pub fn mark_returned(&mut self, message_id: &str) -> bool {
        self.returned.insert(message_id.to_string())
    }

    pub fn is_returned(&self, message_id: &str) -> bool {
        self.returned.contains(message_id)
    }

    /// Resolve the slots covered by an ack or nack and return the ids to
    /// dispatch. Returned messages resolve silently.
    pub fn resolve(&mut self, delivery_tag: DeliveryTag, multiple: bool) -> Vec<String> {
        let mut resolved = Vec::new();
        if multiple {
            // tags beyond the last tracked slot have nothing to resolve
            let last = (self.base + self.slots.len() as DeliveryTag).saturating_sub(1);
            let through = delivery_tag.min(last);
            for tag in self.high_water.saturating_add(1)..=through {
                resolved.extend(self.take(tag));
            }
            self.high_water = self.high_water.max(through);
        } else {
            resolved.extend(self.take(delivery_tag));
        }
        resolved.retain(|id| !self.returned.contains(id));
        resolved
    }

    pub fn is_settled(&self) -> bool {
        self.outstanding == 0
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Ids whose slot was never resolved, in publish order.
    pub fn unresolved(&self) -> Vec<String> {
        self.slots.iter().flatten().cloned().collect()
    }

    fn take(&mut self, tag: DeliveryTag) -> Option<String> {
        let index = usize::try_from(tag.checked_sub(self.base)?).ok()?;
        let id = self.slots.get_mut(index)?.take()?;
        self.outstanding -= 1;
        Some(id)
    }
}
