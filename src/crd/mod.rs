//! Custom Resource Definitions for node-detacher
//!
//! The only CRD is [`Attachment`], the durable record of a node's external
//! load balancer, target group and scaling group registrations.

mod attachment;


pub use attachment::{
    AttachedTarget, Attachment, AttachmentPhase, AttachmentSpec, AttachmentStatus, TargetRef,
};
