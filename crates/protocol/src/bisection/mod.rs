//! Data structures, types, and the bisection challenge state machine shared by every
//! challenge variant.

mod types;
pub use types::*;

mod segments;
pub use segments::{max_rounds, partition, segment_count};

mod event;
pub use event::{ChallengeAction, ChallengeEvent};

mod verifier;
pub use verifier::OneStepVerifier;

mod alphabet;
pub use alphabet::{AlphabetTrace, AlphabetVerifier};

mod challenge;
pub use challenge::{BisectionChallenge, ChallengeConfig, ChallengePhase, ProtocolError};

mod solver;
pub use solver::{AlphabetSolver, Response, Solver};
