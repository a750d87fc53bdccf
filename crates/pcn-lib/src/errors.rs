use ractor::{MessagingErr, SpawnErr};
use thiserror::Error;

use crate::{
    chain::{ChainActorMessage, ResolutionError},
    channel::{ChannelActorMessage, ProcessingChannelError},
    invoice::InvoiceError,
    node::NodeActorMessage,
    switch::SwitchActorMessage,
    types::{Hash256, Pubkey},
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Peer not found error: {0:?}")]
    PeerNotFound(Pubkey),
    #[error("Channel not found error: {0:?}")]
    ChannelNotFound(Hash256),
    #[error("Failed to spawn actor: {0}")]
    SpawnErr(#[from] SpawnErr),
    #[error("Failed to send channel actor message: {0}")]
    ChannelMessagingErr(#[from] MessagingErr<ChannelActorMessage>),
    #[error("Failed to send node actor message: {0}")]
    NodeMessagingErr(#[from] MessagingErr<NodeActorMessage>),
    #[error("Failed to send chain actor message: {0}")]
    ChainMessagingErr(#[from] MessagingErr<ChainActorMessage>),
    #[error("Failed to send switch actor message: {0}")]
    SwitchMessagingErr(#[from] MessagingErr<SwitchActorMessage>),
    #[error("Failed to processing channel: {0}")]
    ChannelError(#[from] ProcessingChannelError),
    #[error("Invoice error: {0:?}")]
    InvoiceError(#[from] InvoiceError),
    #[error("Contract resolution error: {0}")]
    ResolutionError(#[from] ResolutionError),
    #[error("InvalidParameter: {0}")]
    InvalidParameter(String),
    #[error("Invalid peer message: {0}")]
    InvalidPeerMessage(String),
    #[error("Database error: {0}")]
    DBInternalError(String),
    #[error("Internal error: {0}")]
    InternalError(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
