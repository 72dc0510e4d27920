pub mod apply;
pub mod builders;
pub mod cluster;
pub mod config;
pub mod crds {
    pub mod search;
}
pub mod error;
pub mod normalize;
pub mod quantity;
pub mod resources;
pub mod search_controller;
pub mod status;
