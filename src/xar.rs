//! XAR container parsing: fixed header, zlib-compressed table of contents,
//! and the location of the `Content` heap entry.

use std::io::Read;
use std::ops::Range;

use quick_xml::Reader;
use quick_xml::events::Event;

use crate::error::{Error, Result};
use crate::input::MappedArchive;

pub const XAR_MAGIC: &[u8; 4] = b"xar!";
pub const PBZX_MAGIC: &[u8; 4] = b"pbzx";

/// Fixed 28-byte XAR header (big-endian on the wire). The trailing checksum
/// algorithm field is not interesting here.
#[derive(Debug, Clone, Copy)]
pub struct XarHeader {
    pub header_size: u16,
    pub version: u16,
    pub toc_compressed_size: u64,
    pub toc_decompressed_size: u64,
}

pub fn parse_header(data: &[u8]) -> Result<XarHeader> {
    if data.len() < 28 {
        return Err(Error::MalformedArchive("shorter than a XAR header"));
    }
    if &data[0..4] != XAR_MAGIC {
        return Err(Error::MalformedArchive("missing xar! magic"));
    }
    Ok(XarHeader {
        header_size: u16::from_be_bytes(data[4..6].try_into().unwrap()),
        version: u16::from_be_bytes(data[6..8].try_into().unwrap()),
        toc_compressed_size: u64::from_be_bytes(data[8..16].try_into().unwrap()),
        toc_decompressed_size: u64::from_be_bytes(data[16..24].try_into().unwrap()),
    })
}

/// Locate the `pbzx` Content stream inside the mapped archive.
///
/// The returned range is absolute within the archive and verified to start
/// with the PBZX magic.
pub fn locate_content(archive: &MappedArchive) -> Result<Range<usize>> {
    let data = archive.bytes();
    let header = parse_header(data)?;
    if header.version != 1 {
        return Err(Error::MalformedArchive("unsupported XAR version"));
    }

    let toc_start = usize::from(header.header_size);
    let toc_end = usize::try_from(header.toc_compressed_size)
        .ok()
        .and_then(|len| toc_start.checked_add(len))
        .filter(|end| *end <= data.len())
        .ok_or(Error::MalformedArchive("TOC extends past end of archive"))?;

    let toc = inflate_toc(&data[toc_start..toc_end], header.toc_decompressed_size)?;
    let (offset, length) = content_location(&toc)?;

    // Heap offsets are relative to the end of the compressed TOC.
    let start = usize::try_from(offset)
        .ok()
        .and_then(|off| toc_end.checked_add(off))
        .filter(|start| *start <= data.len())
        .ok_or(Error::MalformedArchive("Content offset past end of archive"))?;
    let end = usize::try_from(length)
        .ok()
        .and_then(|len| start.checked_add(len))
        .filter(|end| *end <= data.len())
        .ok_or(Error::MalformedArchive("Content length past end of archive"))?;

    if length < 4 || &data[start..start + 4] != PBZX_MAGIC {
        return Err(Error::MalformedArchive("Content stream is not pbzx"));
    }
    Ok(start..end)
}

fn inflate_toc(compressed: &[u8], expected_len: u64) -> Result<Vec<u8>> {
    let mut toc = Vec::with_capacity(usize::try_from(expected_len).unwrap_or(0));
    flate2::read::ZlibDecoder::new(compressed)
        .read_to_end(&mut toc)
        .map_err(|e| Error::Decode {
            codec: "zlib",
            reason: e.to_string(),
        })?;
    if toc.len() as u64 != expected_len {
        return Err(Error::Decode {
            codec: "zlib",
            reason: format!(
                "TOC inflated to {} bytes, header declares {expected_len}",
                toc.len()
            ),
        });
    }
    Ok(toc)
}

/// Walk the TOC XML for `xar/toc/file[name = "Content"]/data/{offset,length}`.
///
/// Only top-level file entries are considered; the entries nested beneath
/// them describe the payload's own tree and may also carry `name` elements.
fn content_location(toc: &[u8]) -> Result<(u64, u64)> {
    let xml = std::str::from_utf8(toc)
        .map_err(|_| Error::MalformedArchive("table of contents is not UTF-8"))?;
    let mut reader = Reader::from_str(xml);

    let mut path: Vec<String> = Vec::new();
    let mut name: Option<String> = None;
    let mut offset: Option<u64> = None;
    let mut length: Option<u64> = None;

    loop {
        match reader
            .read_event()
            .map_err(|_| Error::MalformedArchive("table of contents is not well-formed XML"))?
        {
            Event::Start(start) => {
                let tag = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                if tag == "file" && at(&path, &["xar", "toc"]) {
                    name = None;
                    offset = None;
                    length = None;
                }
                path.push(tag);
            }
            Event::End(_) => {
                if at(&path, &["xar", "toc", "file"])
                    && name.as_deref() == Some("Content")
                    && let (Some(offset), Some(length)) = (offset, length)
                {
                    return Ok((offset, length));
                }
                path.pop();
            }
            Event::Text(text) => {
                let text = text
                    .unescape()
                    .map_err(|_| Error::MalformedArchive("bad text node in table of contents"))?;
                let text = text.trim();
                if at(&path, &["xar", "toc", "file", "name"]) {
                    name = Some(text.to_string());
                } else if at(&path, &["xar", "toc", "file", "data", "offset"]) {
                    offset = Some(parse_decimal(text)?);
                } else if at(&path, &["xar", "toc", "file", "data", "length"]) {
                    length = Some(parse_decimal(text)?);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Err(Error::MalformedArchive(
        "table of contents has no Content entry",
    ))
}

fn at(path: &[String], want: &[&str]) -> bool {
    path.len() == want.len() && path.iter().zip(want).all(|(a, b)| a == b)
}

fn parse_decimal(text: &str) -> Result<u64> {
    text.parse()
        .map_err(|_| Error::MalformedArchive("non-numeric offset in table of contents"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn deflate(toc: &str) -> Vec<u8> {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(toc.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    fn archive_with_toc(toc: &str, heap: &[u8]) -> Vec<u8> {
        let compressed = deflate(toc);
        let mut data = Vec::new();
        data.extend_from_slice(XAR_MAGIC);
        data.extend_from_slice(&28u16.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&(compressed.len() as u64).to_be_bytes());
        data.extend_from_slice(&(toc.len() as u64).to_be_bytes());
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(&compressed);
        data.extend_from_slice(heap);
        data
    }

    fn toc_with_content(offset: u64, length: u64) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<xar>
 <toc>
  <file id="1"><name>Metadata</name><data><offset>999</offset><length>1</length></data></file>
  <file id="2">
   <name>Content</name>
   <data><offset>{offset}</offset><length>{length}</length></data>
  </file>
 </toc>
</xar>"#
        )
    }

    #[test]
    fn header_round_trip() {
        let data = archive_with_toc(&toc_with_content(0, 8), b"pbzx\0\0\0\0");
        let header = parse_header(&data).unwrap();
        assert_eq!(header.header_size, 28);
        assert_eq!(header.version, 1);
        assert_eq!(header.toc_decompressed_size, toc_with_content(0, 8).len() as u64);
    }

    #[test]
    fn locates_the_content_range() {
        let heap = b"pbzx\0\0\0\0\0\0\0\x10";
        let data = archive_with_toc(&toc_with_content(0, heap.len() as u64), heap);
        let file = write_temp(&data);
        let archive = MappedArchive::open(file.path()).unwrap();
        let range = locate_content(&archive).unwrap();
        assert_eq!(&archive.bytes()[range], heap);
    }

    #[test]
    fn rejects_wrong_magic() {
        assert!(parse_header(b"tar!....this is not a xar header....").is_err());
    }

    #[test]
    fn rejects_toc_without_content() {
        let toc = r#"<xar><toc><file><name>Metadata</name></file></toc></xar>"#;
        let data = archive_with_toc(toc, b"pbzx");
        let file = write_temp(&data);
        let archive = MappedArchive::open(file.path()).unwrap();
        assert!(matches!(
            locate_content(&archive),
            Err(Error::MalformedArchive(_))
        ));
    }

    #[test]
    fn rejects_content_that_is_not_pbzx() {
        let heap = b"nope\0\0\0\0";
        let data = archive_with_toc(&toc_with_content(0, heap.len() as u64), heap);
        let file = write_temp(&data);
        let archive = MappedArchive::open(file.path()).unwrap();
        assert!(locate_content(&archive).is_err());
    }

    fn write_temp(data: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }
}
