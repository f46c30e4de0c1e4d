//! Status page listing the registered services

use std::collections::BTreeSet;
use std::fmt::Write;

/// HTML page with one link per service, `http://<service>.<host>`
pub fn render_status_page(services: &BTreeSet<String>, host: &str) -> String {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html>\n<head><title>hostgate</title></head>\n<body>\n<h1>hostgate</h1>\n",
    );

    if services.is_empty() {
        html.push_str("<p>No services connected.</p>\n");
    } else {
        let _ = writeln!(html, "<p>{} service(s) connected:</p>\n<ul>", services.len());
        for service in services {
            let service = escape(service);
            let _ = writeln!(
                html,
                "<li><a href=\"http://{service}.{host}\">{service}</a></li>",
                service = service,
                host = escape(host)
            );
        }
        html.push_str("</ul>\n");
    }

    html.push_str("</body>\n</html>\n");
    html
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}
