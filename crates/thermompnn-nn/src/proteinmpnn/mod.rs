pub mod configs;
pub mod decoding;
pub mod features;
pub mod layers;
pub mod loss;
pub mod model;
pub mod rigid;
pub mod utilities;
