//! Call tree reconstruction.
//!
//! Rebuilds the caller/callee forest from flat call records using their
//! parent links. Children are ordered by creation sequence.

use std::collections::{HashMap, HashSet};

use crate::error::{Result, TraceError};
use crate::types::{CallId, CallOp, CallRecord, records_from_ops};

/// One call and the calls it made.
#[derive(Debug, Clone)]
pub struct CallNode {
    pub record: CallRecord,
    pub children: Vec<CallNode>,
}

impl CallNode {
    /// Number of calls in this subtree, including this one.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(CallNode::size).sum::<usize>()
    }

    /// Length of the longest root-to-leaf path in this subtree.
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(CallNode::depth).max().unwrap_or(0)
    }
}

/// A parent link that does not form a valid forest edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeViolation {
    /// The parent id does not name any record in the set.
    MissingParent { call_id: CallId, parent_id: CallId },
    /// The parent was created after its child.
    ForwardReference { call_id: CallId, parent_id: CallId },
    /// Parent and child belong to different traces.
    TraceMismatch { call_id: CallId, parent_id: CallId },
}

/// A forest of calls.
#[derive(Debug, Clone, Default)]
pub struct CallTree {
    pub roots: Vec<CallNode>,
}

impl CallTree {
    /// Build the forest from records.
    ///
    /// Records whose parent is not part of the set become roots.
    pub fn build(records: impl IntoIterator<Item = CallRecord>) -> Result<Self> {
        let mut records: Vec<CallRecord> = records.into_iter().collect();
        records.sort_by_key(|r| r.seq);

        let mut seen = HashSet::new();
        for record in &records {
            if !seen.insert(record.id.clone()) {
                return Err(TraceError::DuplicateCall(record.id.clone()));
            }
        }

        let mut children: HashMap<CallId, Vec<CallRecord>> = HashMap::new();
        let mut roots = Vec::new();
        for record in records {
            match record.parent_id.clone() {
                Some(parent) if seen.contains(&parent) => {
                    children.entry(parent).or_default().push(record);
                }
                _ => roots.push(record),
            }
        }

        let roots = roots
            .into_iter()
            .map(|r| Self::attach(r, &mut children))
            .collect();
        Ok(Self { roots })
    }

    /// Build the forest from delivered call mutations.
    pub fn from_ops<'a>(ops: impl IntoIterator<Item = &'a CallOp>) -> Result<Self> {
        Self::build(records_from_ops(ops))
    }

    fn attach(record: CallRecord, children: &mut HashMap<CallId, Vec<CallRecord>>) -> CallNode {
        let kids = children.remove(&record.id).unwrap_or_default();
        CallNode {
            children: kids
                .into_iter()
                .map(|k| Self::attach(k, children))
                .collect(),
            record,
        }
    }

    /// Total number of calls in the forest.
    pub fn len(&self) -> usize {
        self.roots.iter().map(CallNode::size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Depth-first, pre-order walk over every node.
    pub fn walk(&self) -> Vec<&CallNode> {
        let mut out = Vec::new();
        let mut stack: Vec<&CallNode> = self.roots.iter().rev().collect();
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(node.children.iter().rev());
        }
        out
    }

    /// Find a node by call id.
    pub fn find(&self, id: &CallId) -> Option<&CallNode> {
        self.walk().into_iter().find(|n| &n.record.id == id)
    }

    /// All nodes produced by the operation `op_name`.
    pub fn by_op(&self, op_name: &str) -> Vec<&CallNode> {
        self.walk()
            .into_iter()
            .filter(|n| n.record.op_name == op_name)
            .collect()
    }

    /// Check parent links of a flat record set against the forest rules.
    pub fn validate(records: &[CallRecord]) -> Vec<TreeViolation> {
        let by_id: HashMap<&CallId, &CallRecord> = records.iter().map(|r| (&r.id, r)).collect();
        let mut violations = Vec::new();

        for record in records {
            let Some(parent_id) = &record.parent_id else {
                continue;
            };
            match by_id.get(parent_id) {
                None => violations.push(TreeViolation::MissingParent {
                    call_id: record.id.clone(),
                    parent_id: parent_id.clone(),
                }),
                Some(parent) => {
                    if parent.seq >= record.seq {
                        violations.push(TreeViolation::ForwardReference {
                            call_id: record.id.clone(),
                            parent_id: parent_id.clone(),
                        });
                    }
                    if parent.trace_id != record.trace_id {
                        violations.push(TreeViolation::TraceMismatch {
                            call_id: record.id.clone(),
                            parent_id: parent_id.clone(),
                        });
                    }
                }
            }
        }
        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::Call;

    #[test]
    fn test_build_nested_tree() {
        let root = Call::builder("root").start();
        let a = Call::builder("a").parent(Some(root.clone())).start();
        let b = Call::builder("b").parent(Some(root.clone())).start();
        let a1 = Call::builder("a1").parent(Some(a.clone())).start();

        let records = vec![a1.snapshot(), b.snapshot(), root.snapshot(), a.snapshot()];
        assert!(CallTree::validate(&records).is_empty());

        let tree = CallTree::build(records).unwrap();
        assert_eq!(tree.roots.len(), 1);
        assert_eq!(tree.len(), 4);

        let root_node = &tree.roots[0];
        assert_eq!(root_node.record.op_name, "root");
        let names: Vec<_> = root_node
            .children
            .iter()
            .map(|c| c.record.op_name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(root_node.depth(), 3);
        assert_eq!(tree.find(a1.id()).unwrap().record.op_name, "a1");
    }

    #[test]
    fn test_orphans_become_roots() {
        let root = Call::builder("root").start();
        let child = Call::builder("child").parent(Some(root)).start();

        let tree = CallTree::build(vec![child.snapshot()]).unwrap();
        assert_eq!(tree.roots.len(), 1);

        let violations = CallTree::validate(&[child.snapshot()]);
        assert!(matches!(
            violations[0],
            TreeViolation::MissingParent { .. }
        ));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let call = Call::builder("x").start();
        let result = CallTree::build(vec![call.snapshot(), call.snapshot()]);
        assert!(matches!(result, Err(TraceError::DuplicateCall(_))));
    }

    #[test]
    fn test_forward_reference_detected() {
        let early = Call::builder("early").start();
        let late = Call::builder("late").start();

        let mut bad = early.snapshot();
        bad.parent_id = Some(late.id().clone());
        bad.trace_id = late.trace_id().clone();

        let violations = CallTree::validate(&[bad, late.snapshot()]);
        assert_eq!(violations.len(), 1);
        assert!(matches!(
            violations[0],
            TreeViolation::ForwardReference { .. }
        ));
    }
}
