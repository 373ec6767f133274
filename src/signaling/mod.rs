//! Live preview signaling
//!
//! Offer/answer negotiation with the media gateway:
//! - SignalingGateway trait for the wire round trip (HTTP in production)
//! - SignalingClient for validation, timeout and retry
//! - SignalingSession / MediaSession for correlating an answer with its offer
//! - OfferSource for producing the local offer

pub mod client;
pub mod offer;
pub mod session;

pub use client::{HttpSignalingGateway, SignalingClient, SignalingGateway};
pub use offer::{OfferSource, StaticOffer};
pub use session::{
    MediaSession, SessionDescriptor, SignalingAnswer, SignalingReply, SignalingRequest,
    SignalingSession,
};
