/// Line delimited framing.
pub(crate) mod lines;
