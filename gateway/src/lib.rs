//! HTTP adapter for the two-phase payment processor.
//!
//! # Example
//!
//! ```no_run
//! use ticket_engine_gateway::{GatewayConfig, HttpPaymentGateway};
//! use ticket_engine_core::{PaymentGateway, PaymentId};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let gateway = HttpPaymentGateway::new(GatewayConfig::new("secret-key"))?;
//! let view = gateway.fetch_status(&PaymentId::new("abc123")).await?;
//! println!("verified: {}", view.is_verified());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;

pub use client::{GatewayConfig, HttpPaymentGateway};
