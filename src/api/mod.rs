pub(crate) mod artifacts;
pub(crate) mod audit;
pub(crate) mod errors;
pub(crate) mod guards;
pub(crate) mod handlers;
pub(crate) mod mappings;
pub(crate) mod router;
pub(crate) mod submissions;
