//! Stanza building and parsing helpers shared by the bridge and the
//! router. Manual string-based XML handling — only the subset of XMPP
//! Riot's chat service actually speaks.

// ── Stream / auth (bridge handshake) ─────────────────────

pub fn build_stream_open(domain: &str) -> String {
    format!(
        "<?xml version='1.0'?>\
         <stream:stream \
         xmlns='jabber:client' \
         xmlns:stream='http://etherx.jabber.org/streams' \
         to='{domain}' \
         version='1.0'>"
    )
}

/// Riot's custom SASL-like mechanism: authenticate with the RSO access
/// token and PAS token as child elements rather than a base64 payload.
pub fn build_riot_auth(rso_token: &str, pas_token: &str) -> String {
    format!(
        "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='X-Riot-RSO-PAS'>\
         <rso_token>{rso_token}</rso_token>\
         <pas_token>{pas_token}</pas_token>\
         </auth>"
    )
}

pub fn is_sasl_success(data: &str) -> bool {
    data.contains("<success")
}

pub fn offers_riot_mechanism(data: &str) -> bool {
    data.contains("X-Riot-RSO-PAS")
}

pub fn has_stream_features(data: &str) -> bool {
    data.contains("<stream:features")
}

pub fn build_bind_request() -> String {
    "<iq type='set' id='_xmpp_bind1'>\
     <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
     </iq>"
        .to_string()
}

pub fn build_session_request() -> String {
    "<iq type='set' id='_xmpp_session1'>\
     <session xmlns='urn:ietf:params:xml:ns:xmpp-session'/>\
     </iq>"
        .to_string()
}

pub fn build_entitlements_iq(entitlement_token: &str) -> String {
    format!(
        "<iq type='set' id='xmpp_entitlements_0'>\
         <entitlements xmlns='urn:riotgames:entitlements'>\
         <token>{entitlement_token}</token>\
         </entitlements></iq>"
    )
}

pub fn build_roster_get() -> String {
    "<iq type='get' id='roster_1'><query xmlns='jabber:iq:roster'/></iq>".to_string()
}

pub fn build_recent_conversations_get() -> String {
    "<iq type='get' id='recent_convos_2'>\
     <query xmlns='urn:riotgames:conversations:recent'/>\
     </iq>"
        .to_string()
}

pub fn build_empty_presence() -> String {
    "<presence/>".to_string()
}

pub fn build_keepalive() -> &'static str {
    " "
}

// ── MUC (XEP-0045) ──────────────────────────────────────

pub fn build_muc_join(room_jid: &str, nick: &str) -> String {
    format!(
        "<presence to='{room_jid}/{nick}'>\
         <x xmlns='http://jabber.org/protocol/muc'>\
         <history maxstanzas='0'/>\
         </x>\
         </presence>"
    )
}

pub fn build_muc_leave(room_jid: &str, nick: &str) -> String {
    format!("<presence to='{room_jid}/{nick}' type='unavailable'/>")
}

/// Builds an outgoing chat message to the currently joined room/peer,
/// XML-escaping the body so arbitrary user text can never break stanza
/// structure.
pub fn build_outgoing_message(to: &str, body: &str, msg_type: &str) -> String {
    format!(
        "<message to='{to}' type='{msg_type}'><body>{}</body></message>",
        escape_xml(body)
    )
}

pub fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Decodes the minimum XML entity set XMPP bodies actually use: amp, lt,
/// gt, quot, apos. Multi-line whitespace inside the body is left untouched.
pub fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

// ── Shared parsing helpers ───────────────────────────────

/// Extracts an attribute value from an XML tag, handling both quote
/// styles (`attr='x'` and `attr="x"`).
pub fn extract_attr(xml: &str, attr: &str) -> Option<String> {
    let patterns = [format!("{attr}='"), format!("{attr}=\"")];
    for pattern in &patterns {
        if let Some(start) = xml.find(pattern.as_str()) {
            let after = &xml[start + pattern.len()..];
            let quote = pattern.chars().last().unwrap();
            if let Some(end) = after.find(quote) {
                return Some(after[..end].to_string());
            }
        }
    }
    None
}

/// Extracts the inner text of the *innermost* `<tag>...</tag>` occurrence,
/// supporting multi-line content and either quote style on the opening
/// tag's own attributes (irrelevant here since we match the bare tag
/// name, but kept permissive for tags with no attributes as XMPP bodies
/// always are).
pub fn extract_element_text(xml: &str, tag: &str) -> Option<String> {
    let open_prefix = format!("<{tag}");
    let close = format!("</{tag}>");

    let start = xml.find(&open_prefix)?;
    let after_open_tag = &xml[start..];
    let open_end = after_open_tag.find('>')? + 1;
    let content_start = start + open_end;

    let close_pos = xml[content_start..].find(&close)?;
    Some(xml[content_start..content_start + close_pos].to_string())
}

/// Extracts every top-level `<message ...>...</message>` element found in
/// `xml`. Handles both single- and double-quoted attributes and
/// multi-line bodies since it operates on tag boundaries, not lines.
pub fn extract_message_elements(xml: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut search_from = 0;
    while let Some(rel_start) = xml[search_from..].find("<message") {
        let start = search_from + rel_start;
        // Guard against matching inside another tag name, e.g. <messageFoo>.
        let after = xml.as_bytes().get(start + "<message".len());
        if !matches!(after, Some(b' ') | Some(b'>') | Some(b'/')) {
            search_from = start + "<message".len();
            continue;
        }
        match xml[start..].find("</message>") {
            Some(rel_end) => {
                let end = start + rel_end + "</message>".len();
                out.push(xml[start..end].to_string());
                search_from = end;
            }
            None => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_attr_single_and_double_quotes() {
        assert_eq!(
            extract_attr("<message from='a@b/c'>", "from"),
            Some("a@b/c".to_string())
        );
        assert_eq!(
            extract_attr("<message from=\"a@b/c\">", "from"),
            Some("a@b/c".to_string())
        );
    }

    #[test]
    fn test_extract_element_text_multiline_body() {
        let xml = "<message><body>line one\nline two</body></message>";
        assert_eq!(
            extract_element_text(xml, "body"),
            Some("line one\nline two".to_string())
        );
    }

    #[test]
    fn test_unescape_xml_minimum_entity_set() {
        assert_eq!(unescape_xml("gg &amp; wp"), "gg & wp");
        assert_eq!(unescape_xml("&lt;3 &gt;_&lt;"), "<3 >_<");
        assert_eq!(unescape_xml("say &quot;hi&quot; &apos;now&apos;"), "say \"hi\" 'now'");
    }

    #[test]
    fn test_build_muc_join_requests_zero_history() {
        let xml = build_muc_join("party@conf.example", "abcdef12");
        assert!(xml.contains("to='party@conf.example/abcdef12'"));
        assert!(xml.contains("<history maxstanzas='0'/>"));
    }

    #[test]
    fn test_build_outgoing_message_escapes_body() {
        let xml = build_outgoing_message("party@conf.example", "<b>hi</b> & bye", "groupchat");
        assert!(xml.contains("&lt;b&gt;hi&lt;/b&gt; &amp; bye"));
        assert!(!xml.contains("<b>hi</b>"));
    }

    #[test]
    fn test_extract_message_elements_handles_multiple_and_quote_styles() {
        let xml = "<presence/><message from='a@b'><body>hi</body></message><message from=\"c@d\"><body>yo</body></message>";
        let messages = extract_message_elements(xml);
        assert_eq!(messages.len(), 2);
        assert!(messages[0].contains("from='a@b'"));
        assert!(messages[1].contains("from=\"c@d\""));
    }

    #[test]
    fn test_extract_message_elements_does_not_match_tag_name_prefix() {
        let xml = "<messageReceipt/><message from='a@b'><body>hi</body></message>";
        let messages = extract_message_elements(xml);
        assert_eq!(messages.len(), 1);
    }
}
