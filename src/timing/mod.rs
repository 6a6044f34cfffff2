//! Stochastic timing: the inhomogeneous Poisson kernel that decides *when*
//! events fire, and the Markov chain that decides *what happens* inside a
//! session.

pub mod markov;
pub mod poisson;

pub use markov::{session_seed, BrowseChain, BrowseState};
pub use poisson::{thinning_gap, Event, PoissonKernel, RateProfile, StreamTag};
