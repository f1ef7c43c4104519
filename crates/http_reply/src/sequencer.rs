use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Deserialize;

use crate::store::{TestCase, TestCaseStore};

/// What happens once the cursor passed the last test case.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SequenceMode {
    /// Serve every case once, then stop dispatching.
    #[default]
    SinglePass,
    /// Restart from the first case, indefinitely.
    Loop,
}

/// What one call to [`Sequencer::next`] is spent on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchTrigger {
    /// One test case per connection.
    #[default]
    PerConnection,
    /// One test case per request; keep-open cases let a connection carry
    /// several cases back to back.
    PerRequest,
}

/// `Dispatch` is a single cursor decision: the case to emit and where it sits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// Global, gap-free count of decisions made before this one.
    pub sequence: u64,
    /// Position of the case in the store.
    pub position: usize,
    /// True when this decision consumed the last case of a single pass.
    pub exhausts: bool,
    pub case: TestCase,
}

#[derive(Debug, Default)]
struct Cursor {
    position: usize,
    issued: u64,
    exhausted: bool,
}

/// `Sequencer` owns the only mutable state shared between connections. Every
/// read-modify-write of the cursor happens under one lock, so concurrent
/// callers always observe distinct decisions in call order.
#[derive(Debug)]
pub struct Sequencer {
    store: Arc<TestCaseStore>,
    mode: SequenceMode,
    cursor: Mutex<Cursor>,
}

// -- Constructors

impl Sequencer {
    #[must_use]
    pub fn new(store: Arc<TestCaseStore>, mode: SequenceMode) -> Self {
        Self {
            store,
            mode,
            cursor: Mutex::new(Cursor::default()),
        }
    }

    #[must_use]
    pub fn shared(store: TestCaseStore, mode: SequenceMode) -> Arc<Self> {
        Arc::new(Self::new(Arc::new(store), mode))
    }
}

// -- Getters

impl Sequencer {
    #[must_use]
    pub fn store(&self) -> &TestCaseStore {
        &self.store
    }

    #[must_use]
    pub fn mode(&self) -> SequenceMode {
        self.mode
    }

    #[must_use]
    pub fn issued(&self) -> u64 {
        self.lock().issued
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.lock().exhausted
    }

    // The cursor is consistent after every statement, so a poisoned lock
    // still guards a usable value.
    fn lock(&self) -> MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// -- Dispatching

impl Sequencer {
    /// Picks the next test case, or `None` once a single pass is exhausted.
    pub fn next(&self) -> Option<Dispatch> {
        let (position, sequence, exhausts) = {
            let mut cursor = self.lock();
            if cursor.exhausted {
                return None;
            }

            let position = cursor.position;
            let sequence = cursor.issued;

            cursor.issued += 1;
            cursor.position += 1;

            if cursor.position >= self.store.len() {
                match self.mode {
                    SequenceMode::Loop => cursor.position = 0,
                    SequenceMode::SinglePass => cursor.exhausted = true,
                }
            }

            (position, sequence, cursor.exhausted)
        };

        let case = self.store.get(position)?.clone();
        Some(Dispatch {
            sequence,
            position,
            exhausts,
            case,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::BTreeSet, thread};

    fn store_of(count: usize) -> TestCaseStore {
        let cases = (0..count)
            .map(|index| TestCase::new(index.to_string(), format!("payload-{index}").into_bytes()))
            .collect();
        TestCaseStore::from_cases("memory", cases).expect("should build store")
    }

    #[test]
    fn loop_mode_wraps_exactly_modulo_store_size() {
        let size = 4;
        let sequencer = Sequencer::new(Arc::new(store_of(size)), SequenceMode::Loop);

        let positions: Vec<usize> = (0..(2 * size + 3))
            .map(|_| sequencer.next().expect("loop never runs dry").position)
            .collect();

        assert_eq!(positions, vec![0, 1, 2, 3, 0, 1, 2, 3, 0, 1, 2]);
        assert!(!sequencer.is_exhausted());
        assert_eq!(sequencer.issued(), 11);
    }

    #[test]
    fn single_pass_serves_every_case_once() {
        let sequencer = Sequencer::new(Arc::new(store_of(3)), SequenceMode::SinglePass);

        let first = sequencer.next().expect("first");
        let second = sequencer.next().expect("second");
        let third = sequencer.next().expect("third");

        assert_eq!(
            (first.position, second.position, third.position),
            (0, 1, 2)
        );
        assert!(!first.exhausts && !second.exhausts);
        assert!(third.exhausts);
        assert!(sequencer.is_exhausted());
        assert!(sequencer.next().is_none());
        assert_eq!(sequencer.issued(), 3);
    }

    #[test]
    fn dispatch_carries_the_stored_case() {
        let sequencer = Sequencer::shared(store_of(2), SequenceMode::Loop);

        let dispatch = sequencer.next().expect("dispatch");
        assert_eq!(dispatch.case.name(), "0");
        assert_eq!(dispatch.case.payload().as_ref(), b"payload-0");
    }

    #[test]
    fn concurrent_callers_never_share_a_decision() {
        let sequencer = Arc::new(Sequencer::new(Arc::new(store_of(7)), SequenceMode::Loop));

        let workers: Vec<_> = (0..50)
            .map(|_| {
                let sequencer = Arc::clone(&sequencer);
                thread::spawn(move || sequencer.next().expect("loop never runs dry"))
            })
            .collect();

        let dispatches: Vec<Dispatch> = workers
            .into_iter()
            .map(|worker| worker.join().expect("worker should finish"))
            .collect();

        let sequences: BTreeSet<u64> = dispatches.iter().map(|d| d.sequence).collect();
        assert_eq!(sequences, (0..50).collect::<BTreeSet<u64>>());

        for dispatch in &dispatches {
            let expected = usize::try_from(dispatch.sequence).expect("fits") % 7;
            assert_eq!(dispatch.position, expected);
        }
    }

    #[test]
    fn concurrent_single_pass_hands_out_each_case_once() {
        let sequencer = Arc::new(Sequencer::new(
            Arc::new(store_of(20)),
            SequenceMode::SinglePass,
        ));

        let workers: Vec<_> = (0..32)
            .map(|_| {
                let sequencer = Arc::clone(&sequencer);
                thread::spawn(move || sequencer.next().map(|d| d.position))
            })
            .collect();

        let served: Vec<usize> = workers
            .into_iter()
            .filter_map(|worker| worker.join().expect("worker should finish"))
            .collect();

        assert_eq!(served.len(), 20);
        assert_eq!(
            served.into_iter().collect::<BTreeSet<_>>(),
            (0..20).collect::<BTreeSet<_>>()
        );
    }
}
