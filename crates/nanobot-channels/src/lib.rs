mod base;
pub mod discord;
pub mod telegram;
pub mod websocket;
pub mod whatsapp;

pub use base::{bus_inbound_handler, run_outbound_pump, Channel, ChannelRegistry, InboundHandler};
pub use discord::DiscordChannel;
pub use telegram::{TelegramChannel, TelegramStatus};
pub use websocket::WebSocketChannel;
pub use whatsapp::{WhatsAppChannel, WhatsAppStatus};
