//! Restoration worker pool: applies decoded changeset rows against the
//! object store, keyed by object id so two writes to the same object always
//! land on the same worker and apply in commit order (spec.md §4.6).

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::changeset::{BlockProperty, OpType, Row};
use crate::concurrency::job_queue::{JobQueue, Keyed};
use crate::model::ClassId;
use crate::store::object::{CommitVersion, ObjectVersion};
use crate::store::ObjectStore;
use crate::txn::manager::value_from_field;

/// One row application, or (when `row` is `None`) a poison pill telling a
/// worker to exit once dequeued.
pub struct ApplyJob {
    pub class_id: ClassId,
    pub op: OpType,
    pub commit_version: CommitVersion,
    pub properties: Arc<Vec<BlockProperty>>,
    pub row: Option<Row>,
    group: u64,
}

impl ApplyJob {
    pub fn new(class_id: ClassId, op: OpType, commit_version: CommitVersion, properties: Arc<Vec<BlockProperty>>, row: Row) -> Self {
        let group = row.object_id;
        ApplyJob {
            class_id,
            op,
            commit_version,
            properties,
            row: Some(row),
            group,
        }
    }

    fn poison(worker_index: usize) -> Self {
        ApplyJob {
            class_id: 0,
            op: OpType::Insert,
            commit_version: 0,
            properties: Arc::new(Vec::new()),
            row: None,
            // Each poison pill gets its own group so the pool doesn't stall
            // behind an in-flight real job sharing group 0.
            group: u64::MAX - worker_index as u64,
        }
    }
}

impl Keyed for ApplyJob {
    fn group_key(&self) -> u64 {
        self.group
    }
}

/// Applies one decoded row to its class store, bypassing the transaction
/// manager's conflict checks: restoration replays commits strictly in
/// commit-version order, so no write-write race can occur.
pub fn apply_row(store: &ObjectStore, class_id: ClassId, op: OpType, properties: &[BlockProperty], row: &Row) {
    let Ok(class_store) = store.class(class_id) else {
        return;
    };
    let prev = class_store.head(row.object_id);
    let tombstone = op == OpType::Delete;
    let values = properties
        .iter()
        .zip(row.values.iter())
        .map(|(_, field)| value_from_field(class_store, field))
        .collect();
    let node = ObjectVersion {
        id: row.object_id,
        version: row.version,
        prev,
        tombstone,
        properties: values,
        inverse_refs_head: None,
    };
    let handle = class_store.push_node(node);
    class_store.force_publish_head(row.object_id, handle);
}

pub struct RestoreWorkerPool {
    queue: Arc<JobQueue<ApplyJob>>,
    handles: Vec<JoinHandle<()>>,
}

impl RestoreWorkerPool {
    pub fn new(store: Arc<ObjectStore>, worker_count: usize, queue_capacity: usize) -> Self {
        let worker_count = worker_count.max(1);
        let queue: Arc<JobQueue<ApplyJob>> = Arc::new(JobQueue::new(queue_capacity.max(worker_count)));
        let handles = (0..worker_count)
            .map(|_| {
                let queue = queue.clone();
                let store = store.clone();
                std::thread::spawn(move || loop {
                    let job = queue.dequeue_grouped();
                    let done = job.job().row.is_none();
                    if !done {
                        let job = job.into_inner();
                        apply_row(&store, job.class_id, job.op, &job.properties, job.row.as_ref().unwrap());
                    }
                    if done {
                        break;
                    }
                })
            })
            .collect();
        RestoreWorkerPool { queue, handles }
    }

    pub fn submit(&self, job: ApplyJob) {
        self.queue.enqueue(job);
    }

    /// Sends one poison pill per worker and waits for every worker to exit.
    /// Call only after every real job has been submitted.
    pub fn join(self) {
        for i in 0..self.handles.len() {
            self.queue.enqueue(ApplyJob::poison(i));
        }
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::FieldValue;
    use crate::model::{ClassDescriptor, PropertyDescriptor, PropertyType, MASTER_LOG_GROUP};
    use crate::store::object::Value;

    fn store_with_class() -> ObjectStore {
        let mut store = ObjectStore::new();
        store
            .register_class(ClassDescriptor {
                id: 1,
                name: "A".into(),
                abstract_class: false,
                log_group: MASTER_LOG_GROUP,
                properties: vec![PropertyDescriptor {
                    id: 0,
                    name: "v".into(),
                    prop_type: PropertyType::Int,
                    target_class: None,
                    delete_action: None,
                    inverse_tracked: false,
                }],
            })
            .unwrap();
        store
    }

    #[test]
    fn pool_applies_rows_and_joins() {
        let store = Arc::new(store_with_class());
        let pool = RestoreWorkerPool::new(store.clone(), 2, 8);
        let properties = Arc::new(vec![BlockProperty { property_id: 0, prop_type: PropertyType::Int }]);
        for i in 1..=5u64 {
            let row = Row {
                object_id: i,
                version: i,
                values: vec![FieldValue::Int(i as i32)],
            };
            pool.submit(ApplyJob::new(1, OpType::Insert, i, properties.clone(), row));
        }
        pool.join();

        let class_store = store.class(1).unwrap();
        for i in 1..=5u64 {
            let node = class_store.get_visible(i, 100).unwrap();
            assert_eq!(node.properties[0], Value::Int(i as i32));
        }
    }
}
