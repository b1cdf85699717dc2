use std::any::Any;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::types::Result;

/// A named partial intermediate result produced by workers mid-run.
///
/// Feedback objects of the same name are merged by their domain-specific
/// merge operation and forwarded to the client on the progress cadence,
/// before the run completes.
pub trait Feedback: Send {
    fn name(&self) -> &str;

    /// Folds `other` (same name, same concrete type) into `self`.
    fn merge_from(&mut self, other: &dyn Feedback) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

/// Aggregate of feedback objects keyed by name.
#[derive(Default)]
pub struct FeedbackSet {
    objects: BTreeMap<String, Box<dyn Feedback>>,
}

impl FeedbackSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges an object into the aggregate, adopting it as the seed when no
    /// object of that name exists yet.
    pub fn absorb(&mut self, object: Box<dyn Feedback>) -> Result<()> {
        match self.objects.entry(object.name().to_string()) {
            Entry::Occupied(mut existing) => existing.get_mut().merge_from(object.as_ref()),
            Entry::Vacant(slot) => {
                slot.insert(object);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Feedback> {
        self.objects.get(name).map(Box::as_ref)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Hand-off queue between the scheduling loop and the progress reporter.
///
/// Workers post feedback through the dispatcher; the reporter drains the
/// queue on its own cadence and merges into its aggregate set.
#[derive(Default)]
pub struct FeedbackQueue {
    pending: Mutex<Vec<Box<dyn Feedback>>>,
}

impl FeedbackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, object: Box<dyn Feedback>) {
        let mut pending = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        pending.push(object);
    }

    pub fn drain(&self) -> Vec<Box<dyn Feedback>> {
        let mut pending = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::take(&mut *pending)
    }
}
