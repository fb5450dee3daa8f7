use uuid::Uuid;

/// HTML template stored alongside the notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub id: Uuid,
    pub title: String,
    pub body: String,
}
