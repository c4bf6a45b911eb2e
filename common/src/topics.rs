pub const TOPIC_CONTROLLER_STATE: &str = "growlight/controller/state";
pub const TOPIC_CONTROLLER_STATUS: &str = "growlight/controller/status";
