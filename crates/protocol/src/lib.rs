//! Data structures, the bisection challenge state machine, and the solvers used by the
//! rollup challenger.

pub mod bisection;
