pub mod emission;
pub mod live;
pub mod pipeline;
pub mod replay;
