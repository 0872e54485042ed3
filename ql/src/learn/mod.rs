pub mod action_scheduler;
pub mod agent;
pub mod replay_buffer;
pub mod trainer;
