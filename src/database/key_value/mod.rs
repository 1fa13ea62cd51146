pub mod account_data;
pub mod current_state;
pub mod events;
pub mod invites;
pub mod notification_data;
pub mod peeks;
pub mod presence;
pub mod receipts;
pub mod send_to_device;
pub mod topology;
