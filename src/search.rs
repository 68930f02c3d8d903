//! Built-in `Search` service served by the binary.

use rthrift_protocol::{
    ListHeader, MessageType, Protocol, ProtocolError, Readable, Reader, TType, Writable, Writer,
};
use rthrift_server::{expect_request, reject_unknown_method, write_reply, Processor};
use std::io::{Read, Write};

const DEFAULT_PAGE_SIZE: i32 = 10;

/// Arguments of `Search`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchRequest {
    pub query: String,
    /// 1-based page; values below 1 mean the first page.
    pub page_number: i32,
    /// Values below 1 mean the default page size.
    pub result_per_page: i32,
}

impl Writable for SearchRequest {
    fn write<W: Writer + ?Sized>(&self, w: &mut W) -> Result<(), ProtocolError> {
        w.write_struct_begin("SearchRequest")?;
        w.write_field_begin("query", TType::String, 1)?;
        w.write_string(&self.query)?;
        w.write_field_end()?;
        w.write_field_begin("page_number", TType::I32, 2)?;
        w.write_i32(self.page_number)?;
        w.write_field_end()?;
        w.write_field_begin("result_per_page", TType::I32, 3)?;
        w.write_i32(self.result_per_page)?;
        w.write_field_end()?;
        w.write_field_stop()?;
        w.write_struct_end()
    }
}

impl Readable for SearchRequest {
    fn read<R: Reader + ?Sized>(r: &mut R) -> Result<Self, ProtocolError> {
        let mut out = SearchRequest::default();
        r.read_struct_begin()?;
        loop {
            let field = r.read_field_begin()?;
            if field.is_stop() {
                break;
            }
            match (field.id, field.ttype) {
                (1, TType::String) => out.query = r.read_string()?,
                (2, TType::I32) => out.page_number = r.read_i32()?,
                (3, TType::I32) => out.result_per_page = r.read_i32()?,
                (_, ttype) => r.skip(ttype)?,
            }
            r.read_field_end()?;
        }
        r.read_struct_end()?;
        Ok(out)
    }
}

/// Result of `Search`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchResponse {
    pub results: Vec<String>,
    /// Matches across all pages.
    pub total: i32,
}

impl Writable for SearchResponse {
    fn write<W: Writer + ?Sized>(&self, w: &mut W) -> Result<(), ProtocolError> {
        w.write_struct_begin("SearchResponse")?;
        w.write_field_begin("results", TType::List, 1)?;
        w.write_list_begin(ListHeader::new(TType::String, self.results.len()))?;
        for result in &self.results {
            w.write_string(result)?;
        }
        w.write_list_end()?;
        w.write_field_end()?;
        w.write_field_begin("total", TType::I32, 2)?;
        w.write_i32(self.total)?;
        w.write_field_end()?;
        w.write_field_stop()?;
        w.write_struct_end()
    }
}

impl Readable for SearchResponse {
    fn read<R: Reader + ?Sized>(r: &mut R) -> Result<Self, ProtocolError> {
        let mut out = SearchResponse::default();
        r.read_struct_begin()?;
        loop {
            let field = r.read_field_begin()?;
            if field.is_stop() {
                break;
            }
            match (field.id, field.ttype) {
                (1, TType::List) => {
                    let header = r.read_list_begin()?;
                    for _ in 0..header.size {
                        out.results.push(r.read_string()?);
                    }
                    r.read_list_end()?;
                }
                (2, TType::I32) => out.total = r.read_i32()?,
                (_, ttype) => r.skip(ttype)?,
            }
            r.read_field_end()?;
        }
        r.read_struct_end()?;
        Ok(out)
    }
}

/// Answers `Search` calls from a fixed in-memory corpus.
pub struct SearchService {
    corpus: Vec<String>,
}

impl SearchService {
    pub fn new(corpus: Vec<String>) -> Self {
        Self { corpus }
    }

    /// Case-insensitive substring search, paged.
    pub fn search(&self, request: &SearchRequest) -> SearchResponse {
        let query = request.query.to_lowercase();
        let matches: Vec<&String> = self
            .corpus
            .iter()
            .filter(|doc| doc.to_lowercase().contains(&query))
            .collect();

        let per_page = if request.result_per_page < 1 {
            DEFAULT_PAGE_SIZE
        } else {
            request.result_per_page
        } as usize;
        let page = request.page_number.max(1) as usize - 1;

        SearchResponse {
            results: matches
                .iter()
                .skip(page.saturating_mul(per_page))
                .take(per_page)
                .map(|doc| doc.to_string())
                .collect(),
            total: i32::try_from(matches.len()).unwrap_or(i32::MAX),
        }
    }
}

impl Default for SearchService {
    fn default() -> Self {
        Self::new(
            [
                "Thrift binary protocol",
                "Thrift compact protocol",
                "Framed transport",
                "Header transport",
                "Connection pooling",
                "Request cancellation",
                "Protocol auto-detection",
                "Varint and zigzag encoding",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        )
    }
}

impl Processor for SearchService {
    fn process<S: Read + Write>(&self, proto: &mut Protocol<S>) -> Result<(), ProtocolError> {
        let request = proto.read_message_begin()?;
        expect_request(&request)?;
        if request.name != "Search" {
            return reject_unknown_method(proto, &request);
        }

        let args = SearchRequest::read(proto)?;
        proto.read_message_end()?;
        tracing::debug!("Search '{}' page {}", args.query, args.page_number);

        if request.kind == MessageType::Oneway {
            return Ok(());
        }
        write_reply(proto, &request, &self.search(&args))
    }
}
