pub(crate) mod fence;
pub(crate) mod object;
