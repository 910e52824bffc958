//! Routing slips: append-only, duplicate-free paths of hop locators.
//!
//! A command slip records hops in two phases (`stamp_as_arrived` when the
//! command reaches a kernel, `stamp` once the kernel is done with it); an
//! event slip stamps a hop atomically at publication. Entry identity is the
//! locator with its query and fragment stripped, which is also how pending
//! hops survive the wire: a pending entry serializes with a `?tag=arrived`
//! query that comparisons ignore.

use std::sync::{Arc, Mutex};

use url::Url;

use crate::error::RoutingSlipError;

const ARRIVED_TAG: &str = "arrived";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingSlipEntry {
    locator: String,
    tag: Option<String>,
    completed: bool,
}

impl RoutingSlipEntry {
    pub fn new(locator: &Url, tag: Option<String>, completed: bool) -> Self {
        Self {
            locator: normalized(locator),
            tag,
            completed,
        }
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn completed(&self) -> bool {
        self.completed
    }

    /// Wire form: completed entries are the bare locator, pending entries
    /// carry their tag in the query string.
    pub fn to_wire_string(&self) -> String {
        match (&self.tag, self.completed) {
            (Some(tag), false) => format!("{}?tag={tag}", self.locator),
            _ => self.locator.clone(),
        }
    }

    /// Parses the wire form back into an entry.
    pub fn from_wire_string(raw: &str) -> Result<Self, url::ParseError> {
        let url = Url::parse(raw)?;
        let tag = url
            .query_pairs()
            .find(|(key, _)| key == "tag")
            .map(|(_, value)| value.into_owned());
        let completed = tag.is_none();
        Ok(Self {
            locator: normalized(&url),
            tag,
            completed,
        })
    }
}

/// Locator identity ignores the query string and fragment.
fn normalized(locator: &Url) -> String {
    let mut url = locator.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}

#[derive(Debug, Default)]
struct SlipState {
    entries: Mutex<Vec<RoutingSlipEntry>>,
}

impl SlipState {
    fn snapshot(&self) -> Vec<RoutingSlipEntry> {
        self.entries.lock().expect("routing slip lock").clone()
    }

    fn contains(&self, locator: &Url) -> bool {
        let locator = normalized(locator);
        self.entries
            .lock()
            .expect("routing slip lock")
            .iter()
            .any(|entry| entry.locator == locator)
    }

    fn completed_locators(&self) -> Vec<String> {
        self.entries
            .lock()
            .expect("routing slip lock")
            .iter()
            .filter(|entry| entry.completed)
            .map(|entry| entry.locator.clone())
            .collect()
    }

    fn starts_with(&self, other: &SlipState) -> bool {
        let mine = self.completed_locators();
        let theirs = other.completed_locators();
        !theirs.is_empty()
            && theirs.len() <= mine.len()
            && mine.iter().zip(theirs.iter()).all(|(a, b)| a == b)
    }

    /// Extends this slip with the suffix of `other` beyond the shared prefix.
    fn append(&self, other: &SlipState) -> Result<(), RoutingSlipError> {
        let theirs = other.snapshot();
        let mut entries = self.entries.lock().expect("routing slip lock");
        let shared = entries
            .iter()
            .zip(theirs.iter())
            .take_while(|(mine, theirs)| mine.locator == theirs.locator)
            .count();
        for entry in &theirs[shared..] {
            if entries.iter().any(|existing| existing.locator == entry.locator) {
                return Err(RoutingSlipError::DuplicateEntry(entry.locator.clone()));
            }
            entries.push(entry.clone());
        }
        Ok(())
    }

    fn push_unique(&self, entry: RoutingSlipEntry) -> Result<(), RoutingSlipError> {
        let mut entries = self.entries.lock().expect("routing slip lock");
        if entries.iter().any(|existing| existing.locator == entry.locator) {
            return Err(RoutingSlipError::DuplicateEntry(entry.locator));
        }
        entries.push(entry);
        Ok(())
    }

    fn from_entries(entries: Vec<RoutingSlipEntry>) -> Result<Self, RoutingSlipError> {
        let state = SlipState::default();
        for entry in entries {
            state.push_unique(entry)?;
        }
        Ok(state)
    }
}

/// Routing slip for commands: a hop is first marked pending on arrival, then
/// completed once the kernel has finished with the command.
///
/// Clones share the underlying entry list; a command and the contexts holding
/// it observe the same path.
#[derive(Debug, Clone, Default)]
pub struct CommandRoutingSlip {
    state: Arc<SlipState>,
}

impl CommandRoutingSlip {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(
        entries: impl IntoIterator<Item = RoutingSlipEntry>,
    ) -> Result<Self, RoutingSlipError> {
        Ok(Self {
            state: Arc::new(SlipState::from_entries(entries.into_iter().collect())?),
        })
    }

    /// Marks arrival at `locator`. The hop stays pending until [`stamp`]
    /// completes it; arriving twice at the same locator is an error.
    ///
    /// [`stamp`]: CommandRoutingSlip::stamp
    pub fn stamp_as_arrived(&self, locator: &Url) -> Result<(), RoutingSlipError> {
        self.state.push_unique(RoutingSlipEntry::new(
            locator,
            Some(ARRIVED_TAG.to_string()),
            false,
        ))
    }

    /// Completes the pending hop for `locator`.
    pub fn stamp(&self, locator: &Url) -> Result<(), RoutingSlipError> {
        let locator = normalized(locator);
        let mut entries = self.state.entries.lock().expect("routing slip lock");
        match entries.iter_mut().find(|entry| entry.locator == locator) {
            None => Err(RoutingSlipError::MissingEntry(locator)),
            Some(entry) if entry.completed => Err(RoutingSlipError::DuplicateEntry(locator)),
            Some(entry) => {
                entry.completed = true;
                entry.tag = None;
                Ok(())
            }
        }
    }

    pub fn contains(&self, locator: &Url) -> bool {
        self.state.contains(locator)
    }

    pub fn starts_with(&self, other: &CommandRoutingSlip) -> bool {
        self.state.starts_with(&other.state)
    }

    pub fn append(&self, other: &CommandRoutingSlip) -> Result<(), RoutingSlipError> {
        self.state.append(&other.state)
    }

    /// Completed hops, in order.
    pub fn to_locator_array(&self) -> Vec<String> {
        self.state.completed_locators()
    }

    /// All hops (pending included), in order.
    pub fn entries(&self) -> Vec<RoutingSlipEntry> {
        self.state.snapshot()
    }

    pub fn to_wire_array(&self) -> Vec<String> {
        self.state
            .snapshot()
            .iter()
            .map(RoutingSlipEntry::to_wire_string)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.state.entries.lock().expect("routing slip lock").is_empty()
    }
}

impl PartialEq for CommandRoutingSlip {
    fn eq(&self, other: &Self) -> bool {
        self.state.snapshot() == other.state.snapshot()
    }
}

/// Routing slip for events: each hop is stamped exactly once, atomically, at
/// publication.
#[derive(Debug, Clone, Default)]
pub struct EventRoutingSlip {
    state: Arc<SlipState>,
}

impl EventRoutingSlip {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(
        entries: impl IntoIterator<Item = RoutingSlipEntry>,
    ) -> Result<Self, RoutingSlipError> {
        Ok(Self {
            state: Arc::new(SlipState::from_entries(entries.into_iter().collect())?),
        })
    }

    /// Seeds an event slip from the path its command has travelled so far.
    /// Every hop the command arrived at counts, completed or pending; the
    /// seeded entries are completed (the event is a fact about the past).
    pub(crate) fn seeded_from(command_slip: &CommandRoutingSlip) -> Self {
        let entries = command_slip
            .entries()
            .into_iter()
            .map(|entry| RoutingSlipEntry {
                locator: entry.locator,
                tag: None,
                completed: true,
            })
            .collect();
        Self {
            state: Arc::new(SlipState::from_entries(entries).expect("command slip has no duplicates")),
        }
    }

    /// Adds and completes a hop in one step.
    pub fn stamp(&self, locator: &Url) -> Result<(), RoutingSlipError> {
        self.state
            .push_unique(RoutingSlipEntry::new(locator, None, true))
    }

    pub fn contains(&self, locator: &Url) -> bool {
        self.state.contains(locator)
    }

    pub fn starts_with(&self, other: &EventRoutingSlip) -> bool {
        self.state.starts_with(&other.state)
    }

    pub fn append(&self, other: &EventRoutingSlip) -> Result<(), RoutingSlipError> {
        self.state.append(&other.state)
    }

    pub fn to_locator_array(&self) -> Vec<String> {
        self.state.completed_locators()
    }

    pub fn entries(&self) -> Vec<RoutingSlipEntry> {
        self.state.snapshot()
    }

    pub fn to_wire_array(&self) -> Vec<String> {
        self.state
            .snapshot()
            .iter()
            .map(RoutingSlipEntry::to_wire_string)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.state.entries.lock().expect("routing slip lock").is_empty()
    }
}

impl PartialEq for EventRoutingSlip {
    fn eq(&self, other: &Self) -> bool {
        self.state.snapshot() == other.state.snapshot()
    }
}
