/// Native module contains implementations of core traits that drive real
/// compiler and test processes, using syscalls directly for process groups
/// and resource limits.
pub mod compiler;
pub mod process;
pub mod runner;
pub mod workspace;
