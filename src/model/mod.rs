//! Frozen-checkpoint inference: tile classification and class-activation
//! extraction. The checkpoint is an ONNX export of the trained network
//! with two outputs: the class logits and the CAM target-layer
//! activations (feature map for CNN backbones, token sequence for ViT).

pub mod cam;
pub mod classifier;

pub use cam::{peak_pixel, resize_bilinear, CamExtractor};
pub use classifier::{Checkpoint, TileClassifier};
