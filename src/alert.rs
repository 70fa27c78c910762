use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use crate::state::{AlertConfig, AlertTheme};

const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_FROM: &str = "ZedOps Alerts <noreply@example.com>";

/// Send the single per-outage alert to every cached recipient. Each
/// recipient gets HTML templated with their own theme; failures are logged
/// per recipient and never affect session recovery.
pub async fn send_alert_email(config: &AlertConfig, agent_name: &str, reason: &str, failing_for_minutes: i64) {
    if config.resend_api_key.is_empty() || config.alert_recipients.is_empty() {
        return;
    }

    let subject = format!("[ZedOps] Agent \"{agent_name}\" cannot reach manager");
    info!(
        "Sending offline alert email to {} recipient(s)...",
        config.alert_recipients.len()
    );

    for recipient in &config.alert_recipients {
        let html = render_alert_html(&recipient.colors, agent_name, reason, failing_for_minutes);
        if let Err(e) = send_resend_email(config, &recipient.email, &subject, &html).await {
            warn!("Failed to send alert to {}: {}", recipient.email, e);
        }
    }
}

/// Send the recovery message after an outage during which an alert fired.
pub async fn send_recovery_email(config: &AlertConfig, agent_name: &str, downtime_minutes: i64) {
    if config.resend_api_key.is_empty() || config.alert_recipients.is_empty() {
        return;
    }

    let subject = format!("[ZedOps] Agent \"{agent_name}\" is back online");
    info!(
        "Sending recovery email to {} recipient(s)...",
        config.alert_recipients.len()
    );

    for recipient in &config.alert_recipients {
        let html = render_recovery_html(&recipient.colors, agent_name, downtime_minutes);
        if let Err(e) = send_resend_email(config, &recipient.email, &subject, &html).await {
            warn!("Failed to send recovery email to {}: {}", recipient.email, e);
        }
    }
}

async fn send_resend_email(
    config: &AlertConfig,
    to: &str,
    subject: &str,
    html: &str,
) -> Result<(), String> {
    let from = if config.resend_from_email.is_empty() {
        DEFAULT_FROM
    } else {
        config.resend_from_email.as_str()
    };

    let payload = json!({
        "from": from,
        "to": [to],
        "subject": subject,
        "html": html,
    });

    let client = reqwest::Client::builder()
        .timeout(CLIENT_TIMEOUT)
        .build()
        .map_err(|e| format!("failed to build client: {e}"))?;

    let resp = client
        .post(RESEND_ENDPOINT)
        .bearer_auth(&config.resend_api_key)
        .json(&payload)
        .send()
        .await
        .map_err(|e| format!("failed to send email: {e}"))?;

    if resp.status().as_u16() >= 400 {
        return Err(format!("resend API returned status {}", resp.status()));
    }
    Ok(())
}

pub fn render_alert_html(theme: &AlertTheme, agent_name: &str, reason: &str, failing_for_minutes: i64) -> String {
    format!(
        r##"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><meta name="color-scheme" content="dark"></head>
<body style="margin:0;padding:0;background-color:{bg};font-family:-apple-system,BlinkMacSystemFont,'Segoe UI',Roboto,sans-serif;color:{text};">
  <table width="100%" cellpadding="0" cellspacing="0" bgcolor="{bg}" style="padding:40px 20px;">
    <tr><td align="center">
      <table width="100%" cellpadding="0" cellspacing="0" bgcolor="{card}" style="max-width:520px;border-radius:12px;border:1px solid {border};">
        <tr><td bgcolor="{card}" style="padding:32px 32px 16px;text-align:center;border-bottom:1px solid {border};">
          <h1 style="margin:0;font-size:26px;font-weight:700;color:{accent};">ZedOps</h1>
          <p style="margin:6px 0 0;font-size:12px;color:{muted};letter-spacing:1px;text-transform:uppercase;">Agent Alert</p>
        </td></tr>
        <tr><td bgcolor="{card}" style="padding:24px 32px;">
          <p style="margin:0 0 16px;font-size:16px;color:{text};">
            Agent <strong style="color:{accent};">{agent}</strong> has been unable to reach the ZedOps manager for <strong style="color:{error};">{minutes}m</strong>.
          </p>
          <p style="margin:0 0 8px;font-size:14px;color:{muted};">Reason: <strong style="color:{text};">{reason}</strong></p>
          <p style="margin:16px 0 0;font-size:14px;color:{muted};">
            The agent will keep retrying automatically. This alert is sent once per outage.
          </p>
        </td></tr>
        <tr><td bgcolor="{card}" style="padding:16px 32px;border-top:1px solid {border};">
          <p style="margin:0;font-size:12px;color:{muted};text-align:center;">Sent directly by the agent because the manager is unreachable.</p>
        </td></tr>
      </table>
    </td></tr>
  </table>
</body>
</html>"##,
        bg = theme.bg,
        card = theme.card,
        border = theme.border,
        accent = theme.accent,
        text = theme.text,
        muted = theme.muted,
        error = theme.error,
        agent = agent_name,
        reason = reason,
        minutes = failing_for_minutes,
    )
}

pub fn render_recovery_html(theme: &AlertTheme, agent_name: &str, downtime_minutes: i64) -> String {
    format!(
        r##"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><meta name="color-scheme" content="dark"></head>
<body style="margin:0;padding:0;background-color:{bg};font-family:-apple-system,BlinkMacSystemFont,'Segoe UI',Roboto,sans-serif;color:{text};">
  <table width="100%" cellpadding="0" cellspacing="0" bgcolor="{bg}" style="padding:40px 20px;">
    <tr><td align="center">
      <table width="100%" cellpadding="0" cellspacing="0" bgcolor="{card}" style="max-width:520px;border-radius:12px;border:1px solid {border};">
        <tr><td bgcolor="{card}" style="padding:32px 32px 16px;text-align:center;border-bottom:1px solid {border};">
          <h1 style="margin:0;font-size:26px;font-weight:700;color:{accent};">ZedOps</h1>
          <p style="margin:6px 0 0;font-size:12px;color:{muted};letter-spacing:1px;text-transform:uppercase;">Agent Recovery</p>
        </td></tr>
        <tr><td bgcolor="{card}" style="padding:24px 32px;">
          <p style="margin:0 0 16px;font-size:16px;color:{text};">
            Agent <strong style="color:{accent};">{agent}</strong> is back <strong style="color:{success};">online</strong>.
          </p>
          <p style="margin:0;font-size:14px;color:{muted};">
            Total downtime: <strong style="color:{text};">{minutes}m</strong>
          </p>
        </td></tr>
        <tr><td bgcolor="{card}" style="padding:16px 32px;border-top:1px solid {border};">
          <p style="margin:0;font-size:12px;color:{muted};text-align:center;">Connection to ZedOps manager has been restored.</p>
        </td></tr>
      </table>
    </td></tr>
  </table>
</body>
</html>"##,
        bg = theme.bg,
        card = theme.card,
        border = theme.border,
        accent = theme.accent,
        text = theme.text,
        muted = theme.muted,
        success = theme.success,
        agent = agent_name,
        minutes = downtime_minutes,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_html_uses_recipient_theme() {
        let theme = AlertTheme {
            bg: "#000000".into(),
            card: "#111111".into(),
            border: "#222222".into(),
            accent: "#ff8800".into(),
            text: "#ffffff".into(),
            muted: "#888888".into(),
            success: "#00ff00".into(),
            error: "#ff0000".into(),
        };
        let html = render_alert_html(&theme, "node-A", "transient auth failure", 12);
        assert!(html.contains("node-A"));
        assert!(html.contains("transient auth failure"));
        assert!(html.contains("12m"));
        assert!(html.contains("#ff8800"));
        assert!(html.contains("#ff0000"));
        assert!(html.contains("once per outage"));
    }

    #[test]
    fn recovery_html_reports_downtime() {
        let theme = AlertTheme::default();
        let html = render_recovery_html(&theme, "node-A", 47);
        assert!(html.contains("node-A"));
        assert!(html.contains("47m"));
        assert!(html.contains("back"));
        assert!(html.contains(&theme.success));
    }
}
