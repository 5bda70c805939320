//! `pomegranate`: a fault-tolerant, distributed MapReduce orchestration
//! framework. See `mr` for the Coordinator, Master, Worker and supporting
//! subsystems.

pub mod mr;
