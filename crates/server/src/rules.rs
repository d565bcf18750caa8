//! Put-when-ids-close: tasks withheld until a set of data ids (or
//! container subscripts) are all closed.

use crate::workqueue::NewWork;
use codec::DatumId;
use std::collections::HashMap;

type WaitKey = (DatumId, Option<Box<[u8]>>);

struct Rule {
    remaining: usize,
    work: NewWork,
}

/// Withheld tasks keyed by the data they wait on. The owning server
/// subscribes on its own behalf to each waited id; close notifications
/// addressed to a server rank land here rather than in the work queue.
#[derive(Default)]
pub struct RuleEngine {
    next_id: u64,
    rules: HashMap<u64, Rule>,
    by_key: HashMap<WaitKey, Vec<u64>>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Withhold `work` until `remaining` of its watched keys close.
    /// `remaining` counts only keys that were still open at submit time.
    pub fn add(&mut self, work: NewWork, keys: Vec<WaitKey>, remaining: usize) -> Option<NewWork> {
        debug_assert!(remaining <= keys.len());
        if remaining == 0 {
            return Some(work);
        }
        let id = self.next_id;
        self.next_id += 1;
        for key in keys {
            self.by_key.entry(key).or_default().push(id);
        }
        self.rules.insert(
            id,
            Rule {
                remaining,
                work,
            },
        );
        tracing::debug!(rule = id, remaining, "withheld put-rule task");
        None
    }

    /// A watched key closed: decrement its rules and release any that
    /// became ready.
    pub fn close(&mut self, id: DatumId, subscript: Option<&[u8]>) -> Vec<NewWork> {
        let key = (id, subscript.map(Box::from));
        let Some(rule_ids) = self.by_key.remove(&key) else {
            return Vec::new();
        };
        let mut ready = Vec::new();
        for rule_id in rule_ids {
            let Some(rule) = self.rules.get_mut(&rule_id) else {
                continue;
            };
            rule.remaining -= 1;
            if rule.remaining == 0 {
                let rule = self.rules.remove(&rule_id).expect("present");
                tracing::debug!(rule = rule_id, "put-rule task released");
                ready.push(rule.work);
            }
        }
        ready
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    fn work() -> NewWork {
        NewWork {
            work_type: 0,
            priority: 0,
            putter: 0,
            answer: proto::RANK_NULL,
            target: proto::RANK_ANY,
            parallelism: 1,
            payload: Bytes::new(),
        }
    }

    #[test]
    fn releases_only_when_all_keys_close() {
        let mut engine = RuleEngine::new();
        let keys: Vec<WaitKey> = vec![(DatumId(1), None), (DatumId(2), Some(Box::from(&b"k"[..])))];
        assert!(engine.add(work(), keys, 2).is_none());

        assert!(engine.close(DatumId(1), None).is_empty());
        let ready = engine.close(DatumId(2), Some(b"k"));
        assert_eq!(ready.len(), 1);
        assert!(engine.is_empty());
    }

    #[test]
    fn already_satisfied_rules_pass_through() {
        let mut engine = RuleEngine::new();
        assert!(engine.add(work(), vec![], 0).is_some());
    }

    #[test]
    fn closes_of_unwatched_keys_are_ignored() {
        let mut engine = RuleEngine::new();
        assert!(engine.close(DatumId(9), None).is_empty());
    }
}
