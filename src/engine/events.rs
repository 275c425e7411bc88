use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::core::TaskId;
use crate::engine::NodeState;

/// One node state transition, as seen by subscribers of
/// [`Engine::subscribe`](crate::Engine::subscribe).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressEvent {
    pub id: TaskId,
    pub from: NodeState,
    pub to: NodeState,
    pub timestamp: SystemTime,
}

/// Fans events out to every subscriber. Disconnected receivers are ignored.
#[derive(Debug, Default)]
pub(crate) struct EventSink<'a> {
    subscribers: &'a [Sender<ProgressEvent>],
}

impl<'a> EventSink<'a> {
    pub fn new(subscribers: &'a [Sender<ProgressEvent>]) -> Self {
        Self { subscribers }
    }

    pub fn emit(&self, id: &TaskId, from: NodeState, to: NodeState) {
        if self.subscribers.is_empty() {
            return;
        }

        let event = ProgressEvent {
            id: id.clone(),
            from,
            to,
            timestamp: SystemTime::now(),
        };

        for subscriber in self.subscribers {
            let _ = subscriber.send(event.clone());
        }
    }
}
