//! Hot-articles list to RSS 2.0.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde_json::Value;

use crate::config::ChannelMeta;
use crate::error::{Error, Result};
use crate::sandbox::truthy;

pub const ENCLOSURE_TYPE: &str = "image/jpeg";
pub const ORIGINAL_MARKER: &str = "原创";
pub const VIDEO_MARKER: &str = "视频";
pub const AUTHOR_PREFIX: &str = "作者：";
const TAG_SEPARATOR: &str = " | ";

/// One entry of the rendered feed, still unescaped; escaping happens on write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub guid: String,
    pub guid_is_permalink: bool,
    pub author: Option<String>,
    pub description: String,
    pub enclosure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedDocument {
    pub channel: ChannelMeta,
    pub last_build_date: String,
    pub items: Vec<FeedItem>,
}

/// `state.data[0].hotArticlesList`, or a structure error naming the step that failed.
pub fn locate_articles(state: &Value) -> Result<&[Value]> {
    let data = state
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Structure("`data` is missing or not an array".into()))?;
    let first = data
        .first()
        .ok_or_else(|| Error::Structure("`data` is empty".into()))?;
    let list = first
        .get("hotArticlesList")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            Error::Structure("`data[0].hotArticlesList` is missing or not an array".into())
        })?;
    Ok(list.as_slice())
}

/// String form of a scalar field, as the page's own template would print it.
/// Missing, `null` and container values give an empty string.
fn text_field(record: &Value, key: &str) -> String {
    match record.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(n @ Value::Number(_)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

impl FeedItem {
    pub fn from_article(record: &Value) -> Self {
        let title = text_field(record, "title");
        let link = text_field(record, "url");
        let author = record
            .get("user_info")
            .map(|u| text_field(u, "username"))
            .filter(|name| !name.is_empty());

        let mut tags = Vec::new();
        if record.get("is_original").is_some_and(truthy) {
            tags.push(ORIGINAL_MARKER.to_string());
        }
        if record.get("is_video_article").is_some_and(truthy) {
            tags.push(VIDEO_MARKER.to_string());
        }
        if let Some(name) = &author {
            tags.push(format!("{}{}", AUTHOR_PREFIX, name));
        }

        let (guid, guid_is_permalink) = if link.is_empty() {
            (text_field(record, "aid"), false)
        } else {
            (link.clone(), true)
        };
        let enclosure = Some(text_field(record, "pic_path")).filter(|p| !p.is_empty());

        FeedItem {
            title,
            link,
            guid,
            guid_is_permalink,
            author,
            description: tags.join(TAG_SEPARATOR),
            enclosure,
        }
    }
}

/// RFC 1123 in GMT, as `Date.prototype.toUTCString` prints it.
pub fn rfc1123(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

impl FeedDocument {
    pub fn from_articles(channel: ChannelMeta, articles: &[Value], now: DateTime<Utc>) -> Self {
        FeedDocument {
            channel,
            last_build_date: rfc1123(now),
            items: articles.iter().map(FeedItem::from_article).collect(),
        }
    }

    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let mut rss_start = BytesStart::new("rss");
        rss_start.push_attribute(("version", "2.0"));
        writer.write_event(Event::Start(rss_start))?;
        writer.write_event(Event::Start(BytesStart::new("channel")))?;
        write_text_element(&mut writer, "title", &self.channel.title)?;
        write_text_element(&mut writer, "link", &self.channel.link)?;
        write_text_element(&mut writer, "description", &self.channel.description)?;
        write_text_element(&mut writer, "lastBuildDate", &self.last_build_date)?;

        for item in &self.items {
            write_item(&mut writer, item)?;
        }

        writer.write_event(Event::End(BytesEnd::new("channel")))?;
        writer.write_event(Event::End(BytesEnd::new("rss")))?;

        let mut out = writer.into_inner();
        out.push(b'\n');
        String::from_utf8(out).map_err(|e| {
            Error::Render(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }
}

fn write_item<W: std::io::Write>(w: &mut Writer<W>, item: &FeedItem) -> Result<()> {
    w.write_event(Event::Start(BytesStart::new("item")))?;
    write_text_element(w, "title", &item.title)?;
    write_text_element(w, "link", &item.link)?;

    let mut guid = BytesStart::new("guid");
    guid.push_attribute((
        "isPermaLink",
        if item.guid_is_permalink { "true" } else { "false" },
    ));
    w.write_event(Event::Start(guid))?;
    w.write_event(Event::Text(BytesText::new(&sanitize_text(&item.guid))))?;
    w.write_event(Event::End(BytesEnd::new("guid")))?;

    match &item.author {
        Some(name) => write_text_element(w, "author", name)?,
        None => w.write_event(Event::Empty(BytesStart::new("author")))?,
    }

    w.write_event(Event::Start(BytesStart::new("description")))?;
    write_cdata(w, &item.description)?;
    w.write_event(Event::End(BytesEnd::new("description")))?;

    if let Some(url) = &item.enclosure {
        let mut enc = BytesStart::new("enclosure");
        enc.push_attribute(("url", &*sanitize_text(url)));
        enc.push_attribute(("type", ENCLOSURE_TYPE));
        w.write_event(Event::Empty(enc))?;
    }
    w.write_event(Event::End(BytesEnd::new("item")))?;
    Ok(())
}

fn write_text_element<W: std::io::Write>(w: &mut Writer<W>, name: &str, text: &str) -> Result<()> {
    w.write_event(Event::Start(BytesStart::new(name)))?;
    // an empty text event keeps the closing tag on the same line
    w.write_event(Event::Text(BytesText::new(&sanitize_text(text))))?;
    w.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

/// Drops characters XML 1.0 cannot carry at all: C0 controls other than
/// tab, LF and CR, plus the U+FFFE/U+FFFF noncharacters. Escaping cannot
/// represent them, so they are removed.
fn sanitize_text(input: &str) -> Cow<'_, str> {
    fn allowed(c: char) -> bool {
        matches!(c, '\t' | '\n' | '\r') || (c >= ' ' && c != '\u{fffe}' && c != '\u{ffff}')
    }
    if input.chars().all(allowed) {
        Cow::Borrowed(input)
    } else {
        Cow::Owned(input.chars().filter(|&c| allowed(c)).collect())
    }
}

/// A `]]>` inside the text would end the section early, so it is split
/// across two adjacent sections.
fn write_cdata<W: std::io::Write>(w: &mut Writer<W>, text: &str) -> Result<()> {
    let text = sanitize_text(text);
    let parts: Vec<&str> = text.split("]]>").collect();
    let last = parts.len() - 1;
    for (i, part) in parts.iter().enumerate() {
        let mut chunk = String::new();
        if i > 0 {
            chunk.push('>');
        }
        chunk.push_str(part);
        if i < last {
            chunk.push_str("]]");
        }
        w.write_event(Event::CData(BytesCData::new(chunk)))?;
    }
    Ok(())
}
