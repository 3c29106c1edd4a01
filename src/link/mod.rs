pub mod channel_link;
