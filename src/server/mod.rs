// Local HTTP surface for the dashboard front-end.

pub mod handler;
