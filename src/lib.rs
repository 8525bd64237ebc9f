pub mod broker;
pub mod config;
pub mod consumer;
pub mod db;
pub mod error;
pub mod mailer;
pub mod model;
pub mod registration;
pub mod relay;
pub mod token;
