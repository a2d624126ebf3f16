//! AMQP transport (feature `amqp`).

mod lapin;

pub use lapin::create_amqp_connector;
