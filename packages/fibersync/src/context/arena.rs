// process-wide arena of live context records.
//
// wait queues link contexts by id rather than by pointer. resolving an id goes through this
// arena, so a record that has been torn down simply fails to resolve instead of dangling.

use super::{Context, ContextId, Record};
use dashmap::DashMap;
use std::sync::{Arc, LazyLock, Weak};


// records are held weakly: a record lives exactly as long as some `Context` handle to it.
static ARENA: LazyLock<DashMap<ContextId, Weak<Record>>> = LazyLock::new(DashMap::new);


// register a freshly constructed record.
pub(super) fn insert(record: &Arc<Record>) {
    let prev = ARENA.insert(record.id, Arc::downgrade(record));
    debug_assert!(prev.is_none(), "context id reused (internal bug)");
}

// remove a record that is being dropped.
pub(super) fn remove(id: ContextId) {
    ARENA.remove(&id);
}

// resolve an id to a handle, if the context is still alive.
pub(crate) fn lookup(id: ContextId) -> Option<Context> {
    // the shard guard must be released before the upgraded handle can possibly be dropped, since
    // dropping the last handle removes the entry from the same shard.
    let weak = ARENA.get(&id).map(|entry| Weak::clone(entry.value()))?;
    weak.upgrade().map(Context)
}

// resolve an id that is known to be linked into a queue. linked contexts are kept alive by the
// context parked on them, so failure is an internal bug.
pub(crate) fn resolve(id: ContextId) -> Context {
    match lookup(id) {
        Some(ctx) => ctx,
        None => panic!("{} is linked into a wait queue but no longer exists", id),
    }
}
