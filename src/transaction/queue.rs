use super::operation::{Operation, Placement};
use std::collections::VecDeque;

/// Pending operations of a transaction.
///
/// Kept sorted by placement: normal operations in insertion order, then
/// late ones in insertion order, then at most one single-last operation
/// per kind.
#[derive(Debug, Default)]
pub struct OperationQueue {
    operations: VecDeque<Operation>,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mut operation: Operation) {
        match operation.placement() {
            Placement::Normal => self.insert_before(Placement::Late, operation),
            Placement::Late => self.insert_before(Placement::SingleLast, operation),
            Placement::SingleLast => {
                if let Some(pos) = self
                    .operations
                    .iter()
                    .position(|queued| queued.same_kind(&operation))
                {
                    if let Some(previous) = self.operations.remove(pos) {
                        operation.absorb(previous);
                    }
                }
                self.operations.push_back(operation);
            }
        }
    }

    /// Insert in front of the first queued operation placed at `placement`
    /// or later.
    fn insert_before(&mut self, placement: Placement, operation: Operation) {
        match self
            .operations
            .iter()
            .position(|queued| queued.placement() >= placement)
        {
            Some(pos) => self.operations.insert(pos, operation),
            None => self.operations.push_back(operation),
        }
    }

    pub fn pop_front(&mut self) -> Option<Operation> {
        self.operations.pop_front()
    }

    /// Put `operations` back in front of what is still queued, keeping
    /// their order.
    pub fn restore_front(&mut self, operations: Vec<Operation>) {
        for operation in operations.into_iter().rev() {
            self.operations.push_front(operation);
        }
    }

    pub fn take_all(&mut self) -> Vec<Operation> {
        self.operations.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.operations.clear();
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.operations.iter().map(Operation::name).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.operations.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::operation::OperationHandler;
    use crate::worker::MailMessage;
    use std::collections::BTreeSet;

    #[derive(Debug)]
    struct Named(&'static str, Placement);

    impl OperationHandler for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn placement(&self) -> Placement {
            self.1
        }
    }

    fn op(name: &'static str, placement: Placement) -> Operation {
        Operation::custom(Named(name, placement))
    }

    #[test]
    fn test_placement_order() {
        let mut queue = OperationQueue::new();
        queue.add(op("single", Placement::SingleLast));
        queue.add(op("late1", Placement::Late));
        queue.add(op("normal1", Placement::Normal));
        queue.add(op("late2", Placement::Late));
        queue.add(op("normal2", Placement::Normal));

        assert_eq!(
            queue.names(),
            vec!["normal1", "normal2", "late1", "late2", "single"]
        );
    }

    #[test]
    fn test_single_last_collapses_and_merges() {
        let mut queue = OperationQueue::new();
        queue.add(Operation::CleanupNewEids(BTreeSet::from([1])));
        queue.add(Operation::SendMail(vec![MailMessage::new(["a@x.org"], "one", "")]));
        queue.add(Operation::CleanupNewEids(BTreeSet::from([2])));

        assert_eq!(queue.names(), vec!["send_mail", "cleanup_new_eids"]);
        match queue.iter().last() {
            Some(Operation::CleanupNewEids(eids)) => {
                assert_eq!(eids, &BTreeSet::from([1, 2]))
            }
            other => panic!("unexpected operation {other:?}"),
        }
    }

    #[test]
    fn test_restore_front_keeps_order() {
        let mut queue = OperationQueue::new();
        queue.add(op("a", Placement::Normal));
        queue.add(op("b", Placement::Normal));
        queue.add(op("c", Placement::Normal));

        let first = queue.pop_front().unwrap();
        let second = queue.pop_front().unwrap();
        queue.restore_front(vec![first, second]);

        assert_eq!(queue.names(), vec!["a", "b", "c"]);
        assert_eq!(queue.take_all().len(), 3);
        assert!(queue.is_empty());
    }
}
