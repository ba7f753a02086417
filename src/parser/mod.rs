mod classifier;

pub use classifier::{types, Classifier, RouteInfo, RoutingHint};
