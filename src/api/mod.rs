pub(crate) mod errors;
pub(crate) mod guards;
pub(crate) mod handlers;
pub(crate) mod lobby;
pub(crate) mod projects;
pub(crate) mod router;
pub(crate) mod sessions;
