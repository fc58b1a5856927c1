// implementation of the rendezvous channel.
//
// the basic architecture is as such:
//
//     channel
//        |
//        |------ an atomic slot pointer. null means empty. non-null points at a Slot living on the
//        |       stack of the producer that published it, which holds the message and a handle to
//        |       the producer's context. publishing is a null -> slot CAS, claiming is a
//        |       slot -> null CAS. neither needs the lock.
//        |
//        |------ an atomic closed flag. false -> true, never back.
//        |
//        \------ a spinlock around two wait queues: producers that found the slot occupied, and
//                consumers that found it empty.
//
// a producer that publishes then suspends until a consumer has moved the message out of its
// slot. the slot's state tells it whether that actually happened, so permits left over from
// other wakeups never make it return early (which would free the slot under the consumer).
//
// the organization of these modules is as such:
//
//      core: This is the sin-eater of the unsafety. It implements the slot protocol and the
//       ^    queueing, and presents a safe API that speaks in raw outcomes.
//       |
//      api: This is a wrapper around core that adapts it into the public status and error
//           vocabulary, plus the iterator. The crate re-exports this API publicly.
//
// there is also the error module, which contains the status and error types, which is also
// re-exported publicly.

pub(crate) mod error;
pub(crate) mod api;

mod core;
