mod endpoint_selector;

pub use endpoint_selector::EndpointSelector;
