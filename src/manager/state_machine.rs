use crate::chunk::ChunkId;
use crate::manager::error::{ManagerError, ManagerResult};
use crate::manager::types::{HostOutcome, HostingState};
use crate::peer::PeerId;

/// Tracks one chunk being placed on one host, including substitutions
/// after a failed attempt.
#[derive(Debug, Clone)]
pub struct HostingStateMachine {
    chunk_id: ChunkId,
    peer: PeerId,
    state: HostingState,
    replaced: Vec<PeerId>,
}

impl HostingStateMachine {
    pub fn new(chunk_id: ChunkId, peer: PeerId) -> Self {
        Self {
            chunk_id,
            peer,
            state: HostingState::Pending,
            replaced: Vec::new(),
        }
    }

    pub fn state(&self) -> HostingState {
        self.state
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    /// Hosts this attempt moved away from, oldest first.
    pub fn replaced_hosts(&self) -> &[PeerId] {
        &self.replaced
    }

    pub fn transition(&mut self, next: HostingState) -> ManagerResult<HostingState> {
        use HostingState::*;

        let allowed = matches!(
            (self.state, next),
            (Pending, Sent)
                | (Sent, Acknowledged)
                | (Acknowledged, Verified)
                | (Sent, Failed)
                | (Failed, Replaced)
                | (Replaced, Pending)
        );
        if !allowed {
            return Err(ManagerError::InvalidStateTransition(format!(
                "chunk {} on {}: {:?} -> {:?}",
                self.chunk_id, self.peer, self.state, next
            )));
        }

        self.state = next;
        Ok(next)
    }

    /// `Failed -> Replaced -> Pending` with `substitute` as the new host.
    pub fn replace(&mut self, substitute: PeerId) -> ManagerResult<()> {
        self.transition(HostingState::Replaced)?;
        self.replaced.push(self.peer);
        self.peer = substitute;
        self.transition(HostingState::Pending)?;
        Ok(())
    }

    pub fn outcome(&self, relayed: bool, attempts: u32, error: Option<String>) -> HostOutcome {
        HostOutcome {
            peer: self.peer,
            state: self.state,
            relayed,
            attempts,
            error,
        }
    }
}
