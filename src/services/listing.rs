//! Incremental decoder for namespace directory listings.
//!
//! A listing response looks like:
//!
//! ```xml
//! <directory path="/rest/reports" utf8Path="/rest/reports" ...>
//!   <entry urlName="a.pdf" type="object" size="1024" hashScheme="SHA-256" hash="..." .../>
//!   <entry urlName="2021" type="directory" .../>
//! </directory>
//! ```
//!
//! The body is read event by event from an [`AsyncBufRead`], so memory use
//! is bounded by a single `directory` element's entries, never by the
//! response size. Retention, hold, replication and other extended
//! attributes are accepted and ignored.

use crate::{
    errors::ListingError,
    models::entry::{DirectoryListing, Entry, EntryKind},
    paths,
};
use quick_xml::{
    Reader,
    events::{BytesStart, Event},
};
use tokio::io::AsyncBufRead;

const DIRECTORY: &[u8] = b"directory";
const ENTRY: &[u8] = b"entry";

/// Pulls [`DirectoryListing`]s out of a streamed listing body.
pub struct ListingDecoder<R> {
    reader: Reader<R>,
    buf: Vec<u8>,
    open: Option<DirectoryListing>,
}

impl<R: AsyncBufRead + Unpin> ListingDecoder<R> {
    pub fn new(source: R) -> Self {
        let mut reader = Reader::from_reader(source);
        reader.config_mut().trim_text(true);
        Self {
            reader,
            buf: Vec::new(),
            open: None,
        }
    }

    /// Decode the next complete `directory` element.
    ///
    /// Returns `Ok(None)` at the end of the document.
    pub async fn next_listing(&mut self) -> Result<Option<DirectoryListing>, ListingError> {
        loop {
            self.buf.clear();
            match self.reader.read_event_into_async(&mut self.buf).await? {
                Event::Start(start) if is(&start, DIRECTORY) => {
                    self.open = Some(DirectoryListing {
                        path: directory_path(&start)?,
                        entries: Vec::new(),
                    });
                }
                Event::Empty(start) if is(&start, DIRECTORY) => {
                    return Ok(Some(DirectoryListing {
                        path: directory_path(&start)?,
                        entries: Vec::new(),
                    }));
                }
                Event::Start(start) | Event::Empty(start) if is(&start, ENTRY) => {
                    if let Some(listing) = self.open.as_mut() {
                        let entry = decode_entry(&start, &listing.path)?;
                        listing.entries.push(entry);
                    }
                }
                Event::End(end) if end.local_name().as_ref() == DIRECTORY => {
                    if let Some(listing) = self.open.take() {
                        return Ok(Some(listing));
                    }
                }
                Event::Eof => {
                    return match self.open.take() {
                        Some(listing) => Err(ListingError::Truncated(listing.path)),
                        None => Ok(None),
                    };
                }
                _ => {}
            }
        }
    }
}

fn is(start: &BytesStart<'_>, name: &[u8]) -> bool {
    start.local_name().as_ref() == name
}

fn directory_path(start: &BytesStart<'_>) -> Result<String, ListingError> {
    for attr in start.attributes() {
        let attr = attr?;
        if attr.key.local_name().as_ref() == b"path" {
            return Ok(attr.unescape_value()?.into_owned());
        }
    }
    Ok(String::new())
}

fn decode_entry(start: &BytesStart<'_>, parent: &str) -> Result<Entry, ListingError> {
    let mut url_name = None;
    let mut utf8_name = None;
    let mut kind = None;
    let mut size = None;
    let mut hash_scheme = None;
    let mut hash = None;
    let mut custom_metadata = false;

    for attr in start.attributes() {
        let attr = attr?;
        let value = attr.unescape_value()?;
        match attr.key.local_name().as_ref() {
            b"urlName" => url_name = Some(value.into_owned()),
            b"utf8Name" => utf8_name = Some(value.into_owned()),
            b"type" => kind = Some(EntryKind::from_wire(&value)),
            b"size" => size = Some(value.into_owned()),
            b"hashScheme" => hash_scheme = Some(value.into_owned()),
            b"hash" => hash = Some(value.into_owned()),
            b"customMetadata" => custom_metadata = value == "true",
            _ => {}
        }
    }

    let url_name = url_name.ok_or(ListingError::MissingAttribute("urlName"))?;
    let kind = kind.ok_or(ListingError::MissingAttribute("type"))?;
    let size = match size {
        Some(raw) => Some(raw.parse::<i64>().map_err(|_| ListingError::InvalidSize {
            name: url_name.clone(),
            value: raw,
        })?),
        None => None,
    };

    Ok(Entry {
        object_path: paths::join(&[parent, url_name.as_str()]),
        url_name,
        utf8_name,
        kind,
        size,
        hash_scheme,
        hash,
        custom_metadata,
    })
}
