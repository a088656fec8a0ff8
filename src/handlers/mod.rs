pub mod devices;

pub use devices::{get_device_status, get_example_config, list_devices, reconnect_device};
