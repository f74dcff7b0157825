use std::time::SystemTime;

/// Values substituted into disconnect and not-found messages.
#[derive(Debug, Clone, Default)]
pub struct MessageVars {
    pub username: String,
    pub remote_address: String,
    pub local_address: String,
    pub server_address: String,
    pub server_id: String,
}

impl MessageVars {
    pub fn render(&self, template: &str) -> String {
        self.render_at(template, SystemTime::now())
    }

    pub fn render_at(&self, template: &str, now: SystemTime) -> String {
        if !template.contains("{{") {
            return template.to_string();
        }
        let now = humantime::format_rfc3339_seconds(now).to_string();
        template
            .replace("{{username}}", &self.username)
            .replace("{{now}}", &now)
            .replace("{{remoteAddress}}", &self.remote_address)
            .replace("{{localAddress}}", &self.local_address)
            .replace("{{serverAddress}}", &self.server_address)
            .replace("{{serverID}}", &self.server_id)
    }
}
