// atelier-common: wire protocol and daily usage records shared by the
// realtime tracker and its readers

pub mod protocol;
pub mod usage;
