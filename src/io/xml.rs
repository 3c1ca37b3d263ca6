//! The handful of S3 XML documents the client reads and writes.

use quick_xml::escape::{resolve_predefined_entity, unescape};
use quick_xml::{Reader, Writer};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::{CompletedPart, ObjectSummary};
use crate::error::StoreError;

const S3_NAMESPACE: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// One page of a `ListObjectsV2` response.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ListPage {
    pub objects: Vec<ObjectSummary>,
    pub next_continuation_token: Option<String>,
}

/// `<Error><Code/><Message/></Error>` body.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

fn xml_error(err: impl std::fmt::Display) -> StoreError {
    StoreError::Protocol(format!("invalid XML: {err}"))
}

/// Body of `CompleteMultipartUpload`.
pub fn complete_multipart_upload(parts: &[CompletedPart]) -> Result<Vec<u8>, StoreError> {
    let mut writer = Writer::new(Vec::with_capacity(64 + parts.len() * 96));

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Start(
            BytesStart::new("CompleteMultipartUpload").with_attributes([("xmlns", S3_NAMESPACE)]),
        ))
        .map_err(xml_error)?;

    for part in parts {
        writer
            .write_event(Event::Start(BytesStart::new("Part")))
            .map_err(xml_error)?;
        write_text_element(&mut writer, "PartNumber", &part.part_number.to_string())?;
        write_text_element(&mut writer, "ETag", &part.etag)?;
        writer
            .write_event(Event::End(BytesEnd::new("Part")))
            .map_err(xml_error)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("CompleteMultipartUpload")))
        .map_err(xml_error)?;

    Ok(writer.into_inner())
}

fn write_text_element(
    writer: &mut Writer<Vec<u8>>,
    tag: &str,
    text: &str,
) -> Result<(), StoreError> {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .map_err(xml_error)?;
    Ok(())
}

/// Flatten a document into `(element path, text)` pairs, e.g.
/// `("ListBucketResult/Contents/Key", "a.zip")`. Good enough for the flat
/// shapes S3 returns. Text is kept verbatim since keys may carry whitespace.
fn text_nodes(xml: &[u8]) -> Result<Vec<(String, String)>, StoreError> {
    let mut reader = Reader::from_reader(xml);

    let mut path: Vec<String> = Vec::new();
    let mut open: Vec<usize> = Vec::new();
    let mut nodes: Vec<(String, String)> = Vec::new();
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => {
                path.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                nodes.push((path.join("/"), String::new()));
                open.push(nodes.len() - 1);
            }
            Event::End(_) => {
                path.pop();
                open.pop();
            }
            Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                nodes.push((format!("{}/{name}", path.join("/")), String::new()));
            }
            Event::Text(e) => {
                let decoded = e.decode().map_err(xml_error)?;
                let text = unescape(&decoded).map_err(xml_error)?;
                if let Some(&index) = open.last() {
                    nodes[index].1.push_str(&text);
                }
            }
            Event::GeneralRef(e) => {
                let text = match e.resolve_char_ref().map_err(xml_error)? {
                    Some(ch) => ch.to_string(),
                    None => {
                        let name = e.decode().map_err(xml_error)?;
                        resolve_predefined_entity(&name)
                            .ok_or_else(|| xml_error(format!("unknown entity &{name};")))?
                            .to_string()
                    }
                };
                if let Some(&index) = open.last() {
                    nodes[index].1.push_str(&text);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(nodes)
}

fn root_is(nodes: &[(String, String)], name: &str) -> bool {
    nodes.first().is_some_and(|(path, _)| path == name)
}

/// `UploadId` from an `InitiateMultipartUploadResult`.
pub fn parse_upload_id(xml: &[u8]) -> Result<String, StoreError> {
    text_nodes(xml)?
        .into_iter()
        .find(|(path, _)| path == "InitiateMultipartUploadResult/UploadId")
        .map(|(_, text)| text.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| StoreError::Protocol("response carries no UploadId".into()))
}

/// Parse an S3 error document. `None` if the document is something else.
pub fn parse_error(xml: &[u8]) -> Option<ErrorBody> {
    let nodes = text_nodes(xml).ok()?;
    if !root_is(&nodes, "Error") {
        return None;
    }

    let mut body = ErrorBody::default();
    for (path, text) in nodes {
        match path.as_str() {
            "Error/Code" => body.code = text.trim().to_string(),
            "Error/Message" => body.message = text.trim().to_string(),
            _ => {}
        }
    }
    Some(body)
}

/// Parse one `ListObjectsV2` page.
pub fn parse_list_page(xml: &[u8]) -> Result<ListPage, StoreError> {
    let nodes = text_nodes(xml)?;
    if !root_is(&nodes, "ListBucketResult") {
        return Err(StoreError::Protocol("expected ListBucketResult".into()));
    }

    let mut page = ListPage::default();
    let mut truncated = false;
    for (path, text) in nodes {
        match path.as_str() {
            "ListBucketResult/Contents" => page.objects.push(ObjectSummary {
                key: String::new(),
                size: 0,
                content_type: None,
            }),
            "ListBucketResult/Contents/Key" => {
                if let Some(object) = page.objects.last_mut() {
                    object.key = text;
                }
            }
            "ListBucketResult/Contents/Size" => {
                if let Some(object) = page.objects.last_mut() {
                    object.size = text.trim().parse().unwrap_or_default();
                }
            }
            "ListBucketResult/IsTruncated" => truncated = text.trim() == "true",
            "ListBucketResult/NextContinuationToken" => {
                page.next_continuation_token = Some(text.trim().to_string())
            }
            _ => {}
        }
    }

    if !truncated {
        page.next_continuation_token = None;
    }
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_complete_body_in_given_order() {
        let body = complete_multipart_upload(&[
            CompletedPart {
                part_number: 1,
                etag: "\"a1\"".into(),
            },
            CompletedPart {
                part_number: 2,
                etag: "\"b2\"".into(),
            },
        ])
        .unwrap();
        let xml = String::from_utf8(body).unwrap();

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        let first = xml.find("<PartNumber>1</PartNumber>").unwrap();
        let second = xml.find("<PartNumber>2</PartNumber>").unwrap();
        assert!(first < second);
        assert!(
            xml.contains("<ETag>&quot;a1&quot;</ETag>") || xml.contains("<ETag>\"a1\"</ETag>")
        );
    }

    #[test]
    fn reads_upload_id() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?>
<InitiateMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Bucket>bucket</Bucket><Key>out/file.csv</Key><UploadId>VXBsb2FkIElE</UploadId>
</InitiateMultipartUploadResult>"#;
        assert_eq!(parse_upload_id(xml).unwrap(), "VXBsb2FkIElE");
        assert!(parse_upload_id(b"<Other/>").is_err());
    }

    #[test]
    fn reads_error_document() {
        let xml = b"<Error><Code>NoSuchUpload</Code><Message>gone &amp; forgotten</Message></Error>";
        assert_eq!(
            parse_error(xml),
            Some(ErrorBody {
                code: "NoSuchUpload".into(),
                message: "gone & forgotten".into()
            })
        );
        assert_eq!(parse_error(b"<CompleteMultipartUploadResult/>"), None);
    }

    #[test]
    fn reads_list_page() {
        let xml = br#"<ListBucketResult>
  <Name>bucket</Name><Prefix>input</Prefix>
  <Contents><Key>input/a.zip</Key><Size>10</Size></Contents>
  <Contents><Key>input/b &amp; c.zip</Key><Size>20</Size></Contents>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>token-1</NextContinuationToken>
</ListBucketResult>"#;
        let page = parse_list_page(xml).unwrap();
        assert_eq!(page.objects.len(), 2);
        assert_eq!(page.objects[1].key, "input/b & c.zip");
        assert_eq!(page.objects[1].size, 20);
        assert_eq!(page.next_continuation_token.as_deref(), Some("token-1"));
    }

    #[test]
    fn keys_keep_surrounding_whitespace() {
        let xml = br#"<ListBucketResult>
  <Contents><Key> input/padded.zip </Key><Size>
    7
  </Size></Contents>
  <IsTruncated> false </IsTruncated>
  <NextContinuationToken>ignored</NextContinuationToken>
</ListBucketResult>"#;
        let page = parse_list_page(xml).unwrap();
        assert_eq!(page.objects[0].key, " input/padded.zip ");
        assert_eq!(page.objects[0].size, 7);
        assert_eq!(page.next_continuation_token, None);

        let initiated = b"<InitiateMultipartUploadResult><UploadId>\n  id-1\n</UploadId></InitiateMultipartUploadResult>";
        assert_eq!(parse_upload_id(initiated).unwrap(), "id-1");
    }
}
