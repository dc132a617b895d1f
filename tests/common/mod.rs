#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::{Cursor, Read};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use byteorder::{BigEndian, WriteBytesExt};
use serde_json::json;

use wekeo_broker::broker::{BrokerClient, BrokerReply, CatalogClient, ContentFetcher};
use wekeo_broker::domain::{Credential, JobHandle};
use wekeo_broker::error::WekeoError;
use wekeo_broker::progress::{ProgressEvent, ProgressSink};
use wekeo_broker::query::QueryDocument;

pub type Scripted = Mutex<VecDeque<Result<BrokerReply, WekeoError>>>;

/// In-process broker. Status replies are served in order; once the script
/// runs out every check reports `running`.
#[derive(Default)]
pub struct FakeBroker {
    pub submit: Scripted,
    pub statuses: Scripted,
    pub result: Scripted,
    pub order: Scripted,
    pub datasets: Scripted,
    pub metadata: Scripted,
    pub content: Mutex<HashMap<String, Vec<u8>>>,
    pub submitted: Mutex<Vec<QueryDocument>>,
    pub ordered: Mutex<Vec<(String, String)>>,
    pub credentials: Mutex<Vec<String>>,
    pub submit_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub result_calls: AtomicUsize,
    pub order_calls: AtomicUsize,
    pub open_calls: AtomicUsize,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_submit(self, reply: BrokerReply) -> Self {
        push(&self.submit, Ok(reply));
        self
    }

    pub fn with_statuses(self, statuses: &[&str]) -> Self {
        for status in statuses {
            push(
                &self.statuses,
                Ok(BrokerReply::ok(json!({ "status": status }).to_string())),
            );
        }
        self
    }

    pub fn with_status_reply(self, reply: Result<BrokerReply, WekeoError>) -> Self {
        push(&self.statuses, reply);
        self
    }

    pub fn with_result(self, reply: BrokerReply) -> Self {
        push(&self.result, Ok(reply));
        self
    }

    pub fn with_manifest(self, url: &str, filename: &str) -> Self {
        self.with_result(BrokerReply::ok(
            json!({ "content": [{ "url": url, "filename": filename }] }).to_string(),
        ))
    }

    pub fn with_order(self, reply: BrokerReply) -> Self {
        push(&self.order, Ok(reply));
        self
    }

    pub fn with_datasets(self, reply: BrokerReply) -> Self {
        push(&self.datasets, Ok(reply));
        self
    }

    pub fn with_metadata(self, reply: BrokerReply) -> Self {
        push(&self.metadata, Ok(reply));
        self
    }

    pub fn with_content(self, url: &str, bytes: Vec<u8>) -> Self {
        self.content.lock().unwrap().insert(url.to_string(), bytes);
        self
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn record(&self, credential: &Credential) {
        self.credentials
            .lock()
            .unwrap()
            .push(credential.header_value());
    }
}

fn push(script: &Scripted, reply: Result<BrokerReply, WekeoError>) {
    script.lock().unwrap().push_back(reply);
}

fn next(script: &Scripted, what: &str) -> Result<BrokerReply, WekeoError> {
    script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Err(WekeoError::BrokerHttp(format!("no scripted {what} reply"))))
}

impl BrokerClient for FakeBroker {
    fn post_data_request(
        &self,
        query: &QueryDocument,
        credential: &Credential,
    ) -> Result<BrokerReply, WekeoError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.record(credential);
        self.submitted.lock().unwrap().push(query.clone());
        next(&self.submit, "submit")
    }

    fn fetch_status(
        &self,
        _job: &JobHandle,
        credential: &Credential,
    ) -> Result<BrokerReply, WekeoError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.record(credential);
        self.statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(BrokerReply::ok(r#"{"status":"running"}"#)))
    }

    fn fetch_result(
        &self,
        _job: &JobHandle,
        credential: &Credential,
    ) -> Result<BrokerReply, WekeoError> {
        self.result_calls.fetch_add(1, Ordering::SeqCst);
        self.record(credential);
        next(&self.result, "result")
    }

    fn post_order(
        &self,
        job: &JobHandle,
        uri: &str,
        credential: &Credential,
    ) -> Result<BrokerReply, WekeoError> {
        self.order_calls.fetch_add(1, Ordering::SeqCst);
        self.record(credential);
        self.ordered
            .lock()
            .unwrap()
            .push((job.to_string(), uri.to_string()));
        next(&self.order, "order")
    }
}

impl CatalogClient for FakeBroker {
    fn list_datasets(&self, _size: usize) -> Result<BrokerReply, WekeoError> {
        next(&self.datasets, "datasets")
    }

    fn query_metadata(
        &self,
        _dataset_id: &str,
        credential: &Credential,
    ) -> Result<BrokerReply, WekeoError> {
        self.record(credential);
        next(&self.metadata, "metadata")
    }
}

impl ContentFetcher for FakeBroker {
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, WekeoError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        match self.content.lock().unwrap().get(url) {
            Some(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            None => Err(WekeoError::BrokerStatus {
                status: 404,
                message: format!("nothing at {url}"),
            }),
        }
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(ProgressEvent::message)
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub const NC_BYTE: u32 = 1;
pub const NC_CHAR: u32 = 2;
pub const NC_SHORT: u32 = 3;
pub const NC_INT: u32 = 4;
pub const NC_FLOAT: u32 = 5;
pub const NC_DOUBLE: u32 = 6;
pub const NC_UINT64: u32 = 11;

pub struct NcAttr {
    pub name: String,
    pub nc_type: u32,
    pub nelems: u64,
    pub bytes: Vec<u8>,
}

impl NcAttr {
    pub fn text(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            nc_type: NC_CHAR,
            nelems: value.len() as u64,
            bytes: value.as_bytes().to_vec(),
        }
    }
}

pub struct NcVar {
    pub name: String,
    pub dims: Vec<usize>,
    pub nc_type: u32,
    pub attrs: Vec<NcAttr>,
    /// Big-endian data; record variables hold their records back to back.
    pub data: Vec<u8>,
}

/// Writes NetCDF classic containers for fixtures.
pub struct NcFile {
    pub version: u8,
    pub records: u64,
    pub streaming: bool,
    /// Length 0 marks the record dimension.
    pub dims: Vec<(String, u64)>,
    pub attrs: Vec<NcAttr>,
    pub vars: Vec<NcVar>,
}

impl NcFile {
    fn is_record(&self, var: &NcVar) -> bool {
        var.dims.first().is_some_and(|id| self.dims[*id].1 == 0)
    }

    fn slab(&self, var: &NcVar) -> u64 {
        if self.is_record(var) {
            var.data.len() as u64 / self.records.max(1)
        } else {
            var.data.len() as u64
        }
    }

    fn non_neg(&self, buf: &mut Vec<u8>, value: u64) {
        if self.version == 5 {
            buf.write_u64::<BigEndian>(value).unwrap();
        } else {
            buf.write_u32::<BigEndian>(value as u32).unwrap();
        }
    }

    fn offset(&self, buf: &mut Vec<u8>, value: u64) {
        if self.version == 1 {
            buf.write_u32::<BigEndian>(value as u32).unwrap();
        } else {
            buf.write_u64::<BigEndian>(value).unwrap();
        }
    }

    fn name(&self, buf: &mut Vec<u8>, name: &str) {
        self.non_neg(buf, name.len() as u64);
        buf.extend_from_slice(name.as_bytes());
        pad(buf);
    }

    fn attrs(&self, buf: &mut Vec<u8>, attrs: &[NcAttr]) {
        if attrs.is_empty() {
            buf.write_u32::<BigEndian>(0).unwrap();
            self.non_neg(buf, 0);
            return;
        }
        buf.write_u32::<BigEndian>(0x0C).unwrap();
        self.non_neg(buf, attrs.len() as u64);
        for attr in attrs {
            self.name(buf, &attr.name);
            buf.write_u32::<BigEndian>(attr.nc_type).unwrap();
            self.non_neg(buf, attr.nelems);
            buf.extend_from_slice(&attr.bytes);
            pad(buf);
        }
    }

    fn header(&self, begins: &[u64]) -> Vec<u8> {
        let mut buf = b"CDF".to_vec();
        buf.push(self.version);
        let numrecs = match (self.streaming, self.version) {
            (true, 5) => u64::MAX,
            (true, _) => u64::from(u32::MAX),
            (false, _) => self.records,
        };
        self.non_neg(&mut buf, numrecs);

        buf.write_u32::<BigEndian>(if self.dims.is_empty() { 0 } else { 0x0A })
            .unwrap();
        self.non_neg(&mut buf, self.dims.len() as u64);
        for (name, len) in &self.dims {
            self.name(&mut buf, name);
            self.non_neg(&mut buf, *len);
        }

        self.attrs(&mut buf, &self.attrs);

        buf.write_u32::<BigEndian>(if self.vars.is_empty() { 0 } else { 0x0B })
            .unwrap();
        self.non_neg(&mut buf, self.vars.len() as u64);
        for (var, begin) in self.vars.iter().zip(begins) {
            self.name(&mut buf, &var.name);
            self.non_neg(&mut buf, var.dims.len() as u64);
            for id in &var.dims {
                self.non_neg(&mut buf, *id as u64);
            }
            self.attrs(&mut buf, &var.attrs);
            buf.write_u32::<BigEndian>(var.nc_type).unwrap();
            self.non_neg(&mut buf, padded(self.slab(var)));
            self.offset(&mut buf, *begin);
        }
        buf
    }

    pub fn encode(&self) -> Vec<u8> {
        let header_len = self.header(&vec![0; self.vars.len()]).len() as u64;
        let record_vars: Vec<&NcVar> = self.vars.iter().filter(|v| self.is_record(v)).collect();
        let lone_record = record_vars.len() == 1;

        let mut begins = Vec::new();
        let mut offset = header_len;
        for var in self.vars.iter().filter(|v| !self.is_record(v)) {
            begins.push((var.name.clone(), offset));
            offset += padded(var.data.len() as u64);
        }
        for var in &record_vars {
            begins.push((var.name.clone(), offset));
            offset += padded(self.slab(var));
        }
        let ordered: Vec<u64> = self
            .vars
            .iter()
            .map(|var| {
                begins
                    .iter()
                    .find(|(name, _)| *name == var.name)
                    .map(|(_, begin)| *begin)
                    .unwrap()
            })
            .collect();

        let mut buf = self.header(&ordered);
        for var in self.vars.iter().filter(|v| !self.is_record(v)) {
            buf.extend_from_slice(&var.data);
            pad(&mut buf);
        }
        for record in 0..self.records {
            for var in &record_vars {
                let slab = self.slab(var) as usize;
                let start = record as usize * slab;
                buf.extend_from_slice(&var.data[start..start + slab]);
                if !lone_record {
                    pad(&mut buf);
                }
            }
        }
        buf
    }
}

fn padded(len: u64) -> u64 {
    len.div_ceil(4) * 4
}

fn pad(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

pub fn floats(values: &[f32]) -> Vec<u8> {
    let mut buf = Vec::new();
    for value in values {
        buf.write_f32::<BigEndian>(*value).unwrap();
    }
    buf
}

pub fn doubles(values: &[f64]) -> Vec<u8> {
    let mut buf = Vec::new();
    for value in values {
        buf.write_f64::<BigEndian>(*value).unwrap();
    }
    buf
}

pub fn shorts(values: &[i16]) -> Vec<u8> {
    let mut buf = Vec::new();
    for value in values {
        buf.write_i16::<BigEndian>(*value).unwrap();
    }
    buf
}

/// Bottom temperature for record `record`, cell `cell`.
pub fn bottom_t(record: usize, cell: usize) -> f32 {
    280.0 + (record * 12 + cell) as f32 * 0.5
}

/// Sea-bottom temperature extraction: two daily records on a 3x4 grid.
pub fn sea_bottom_file(version: u8) -> NcFile {
    let bottom: Vec<f32> = (0..2)
        .flat_map(|record| (0..12).map(move |cell| bottom_t(record, cell)))
        .collect();
    NcFile {
        version,
        records: 2,
        streaming: false,
        dims: vec![
            ("time".to_string(), 0),
            ("lat".to_string(), 3),
            ("lon".to_string(), 4),
        ],
        attrs: vec![NcAttr::text("title", "NWS bottom temperature")],
        vars: vec![
            NcVar {
                name: "lat".to_string(),
                dims: vec![1],
                nc_type: NC_FLOAT,
                attrs: vec![NcAttr::text("units", "degrees_north")],
                data: floats(&[50.0, 50.5, 51.0]),
            },
            NcVar {
                name: "lon".to_string(),
                dims: vec![2],
                nc_type: NC_FLOAT,
                attrs: vec![NcAttr::text("units", "degrees_east")],
                data: floats(&[-5.0, -4.5, -4.0, -3.5]),
            },
            NcVar {
                name: "time".to_string(),
                dims: vec![0],
                nc_type: NC_DOUBLE,
                attrs: vec![NcAttr::text("units", "hours since 2022-01-01")],
                data: doubles(&[0.0, 24.0]),
            },
            NcVar {
                name: "bottomT".to_string(),
                dims: vec![0, 1, 2],
                nc_type: NC_FLOAT,
                attrs: vec![NcAttr::text("units", "K")],
                data: floats(&bottom),
            },
        ],
    }
}

pub fn sea_bottom_netcdf() -> Vec<u8> {
    sea_bottom_file(1).encode()
}
