pub(crate) mod app;

pub(crate) mod logging;

pub(crate) mod mem_store;

pub(crate) mod network;

pub(crate) mod node;
