//! HTML rendering for the chat page.

use pulldown_cmark::escape::escape_html;
use pulldown_cmark::{html, Event, Options, Parser};
use shared::{Role, Turn};

const CHAT_PLACEHOLDER: &str = "How can I help you today?";

const STYLE: &str = r#"
body { font-family: system-ui, sans-serif; max-width: 48rem; margin: 0 auto; padding: 1rem; }
.turn { border-radius: 0.5rem; padding: 0.5rem 1rem; margin: 0.5rem 0; }
.turn .role { font-size: 0.75rem; font-weight: 600; text-transform: uppercase; opacity: 0.6; }
.turn.user { background: #eef3ff; }
.turn.assistant { background: #f6f6f6; }
.turn.failed { background: #fff1f0; color: #a8071a; }
form { display: flex; gap: 0.5rem; margin-top: 1rem; }
form input[type=text] { flex: 1; padding: 0.5rem; }
form.reset { justify-content: flex-end; }
.notice { color: #a8071a; }
"#;

/// Escape text for use in HTML content and attribute values.
pub fn escape_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    escape_html(&mut escaped, text)
        .map(|()| escaped)
        .unwrap_or_default()
}

/// Render Markdown, showing any embedded raw HTML as text. The result is
/// sanitized, so links and images only keep safe URL schemes.
pub fn render_markdown(text: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    let events = Parser::new_ext(text, options).map(|event| match event {
        Event::Html(raw) => Event::Text(raw),
        other => other,
    });

    let mut rendered = String::with_capacity(text.len() * 3 / 2);
    html::push_html(&mut rendered, events);
    ammonia::clean(&rendered)
}

fn render_turn(turn: &Turn) -> String {
    let body = match turn.role {
        Role::Assistant if !turn.failed => render_markdown(&turn.content),
        _ => format!("<p>{}</p>", escape_text(&turn.content)),
    };
    let failed = if turn.failed { " failed" } else { "" };

    format!(
        "<div class=\"turn {role}{failed}\"><div class=\"role\">{role}</div>{body}</div>\n",
        role = turn.role.as_str(),
        failed = failed,
        body = body,
    )
}

/// Full chat page: title, transcript in order, input box. `notice` is shown
/// above the input when the last submission was rejected.
pub fn render_chat_page(
    page_title: &str,
    header_title: &str,
    turns: &[Turn],
    notice: Option<&str>,
) -> String {
    let transcript: String = turns.iter().map(render_turn).collect();
    let notice = notice
        .map(|text| format!("<p class=\"notice\">{}</p>\n", escape_text(text)))
        .unwrap_or_default();

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{page_title}</title>
<style>{style}</style>
</head>
<body>
<h1>{header_title}</h1>
<main id="transcript">
{transcript}</main>
{notice}<form method="post" action="/">
<input type="text" name="prompt" placeholder="{placeholder}" autocomplete="off" autofocus>
<button type="submit">Send</button>
</form>
<form class="reset" method="post" action="/reset">
<button type="submit">New conversation</button>
</form>
</body>
</html>
"#,
        page_title = escape_text(page_title),
        header_title = escape_text(header_title),
        style = STYLE,
        transcript = transcript,
        notice = notice,
        placeholder = CHAT_PLACEHOLDER,
    )
}
