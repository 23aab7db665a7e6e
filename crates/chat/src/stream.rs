/// Identifier for one streaming exchange.
///
/// Changes on every send, regenerate and resume so stale events can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamSessionId(pub u64);

impl StreamSessionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Stream routing key used for stale-event rejection.
///
/// `epoch` is the hydration epoch of the tree the exchange was issued against, so events
/// from a conversation that has since been replaced never touch the new tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub epoch: u64,
    pub session_id: StreamSessionId,
}

impl StreamTarget {
    pub const fn new(epoch: u64, session_id: StreamSessionId) -> Self {
        Self { epoch, session_id }
    }
}

/// What a live exchange is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangePhase {
    #[default]
    Generating,
    /// The workflow run waits on a human input form; the server has no task to stop.
    AwaitingInput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Completed,
    Failed(String),
    Cancelled,
    /// The stream ended while the workflow waited on input; a later resume picks it up.
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Live {
        target: StreamTarget,
        phase: ExchangePhase,
    },
    Settled {
        target: StreamTarget,
        outcome: ExchangeOutcome,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransition {
    Open {
        target: StreamTarget,
        phase: ExchangePhase,
    },
    Enter {
        target: StreamTarget,
        phase: ExchangePhase,
    },
    Settle {
        target: StreamTarget,
        outcome: ExchangeOutcome,
    },
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    Busy {
        live: StreamTarget,
        requested: StreamTarget,
    },
    Stale {
        live: StreamTarget,
        requested: StreamTarget,
    },
    NotLive {
        requested: StreamTarget,
    },
}

pub type StreamTransitionResult = Result<StreamState, StreamTransitionRejection>;

impl StreamState {
    pub fn live_target(&self) -> Option<StreamTarget> {
        match self {
            Self::Live { target, .. } => Some(*target),
            Self::Idle | Self::Settled { .. } => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live { .. })
    }

    /// Waiting on human input, either on a live stream or after it was suspended.
    pub fn is_paused(&self) -> bool {
        matches!(
            self,
            Self::Live {
                phase: ExchangePhase::AwaitingInput,
                ..
            } | Self::Settled {
                outcome: ExchangeOutcome::Suspended,
                ..
            }
        )
    }

    pub fn accepts_stream_event(&self, target: StreamTarget) -> bool {
        self.live_target() == Some(target)
    }

    /// Opening a new exchange needs no live one; every other transition must name the live
    /// exchange exactly.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Open { target, phase } => match self.live_target() {
                Some(live) if live != target => Err(StreamTransitionRejection::Busy {
                    live,
                    requested: target,
                }),
                _ => Ok(Self::Live { target, phase }),
            },
            StreamTransition::Enter { target, phase } => {
                self.require_live(target)?;
                Ok(Self::Live { target, phase })
            }
            StreamTransition::Settle { target, outcome } => {
                self.require_live(target)?;
                Ok(Self::Settled { target, outcome })
            }
            StreamTransition::Reset => Ok(Self::Idle),
        }
    }

    fn require_live(&self, requested: StreamTarget) -> Result<(), StreamTransitionRejection> {
        match self.live_target() {
            Some(live) if live == requested => Ok(()),
            Some(live) => Err(StreamTransitionRejection::Stale { live, requested }),
            None => Err(StreamTransitionRejection::NotLive { requested }),
        }
    }
}
