mod delivery;
mod newsletter;
mod recipient;
mod subscriber_email;
mod subscriber_name;

pub use delivery::{DeliveryRecord, DeliveryStatus};
pub use newsletter::{FontFamily, Newsletter, NewsletterContent, NewsletterStatus};
pub use recipient::{Recipient, RecipientStatus, UnsubscribeToken};
pub use subscriber_email::SubscriberEmail;
pub use subscriber_name::SubscriberName;
