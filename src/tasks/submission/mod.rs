mod maintenance;
mod worker;

pub(crate) use maintenance::report_stuck_requests;
pub(crate) use worker::process_leased;
