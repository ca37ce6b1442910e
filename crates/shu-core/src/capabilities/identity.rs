// Executing user's canonical identity, under host-controlled visibility

pub struct IdentityCapability {
    user_id: String,
    email: Option<String>,
}

impl IdentityCapability {
    pub fn new(user_id: &str, email: Option<&str>) -> Self {
        Self {
            user_id: user_id.to_string(),
            email: email.map(str::to_string),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// None when the host did not expose the email for this call
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }
}
