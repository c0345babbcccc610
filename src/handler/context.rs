use std::collections::BTreeMap;

use crate::image::{Dimension, Format, Identifier, Info, Metadata, OperationList, ScaleConstraint};

/// Per-request facts, filled in as a request handler learns them and read
/// by authorization and delegate code.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub client_ip: Option<String>,
    pub request_headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub identifier: Option<Identifier>,
    pub full_size: Option<Dimension>,
    pub resulting_size: Option<Dimension>,
    pub metadata: Option<Metadata>,
    pub operation_list: Option<OperationList>,
    pub output_format: Option<Format>,
    pub page_count: Option<usize>,
    pub page_number: Option<usize>,
    pub scale_constraint: Option<ScaleConstraint>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.insert(name.into(), value.into());
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    /// Record what is known once an [`Info`] is available.
    pub(crate) fn set_info(&mut self, info: &Info, page: usize) {
        self.full_size = info.size(page).ok();
        self.metadata = Some(info.metadata.clone());
        self.page_count = Some(info.page_count());
    }

    /// Record a frozen operation list and the size it produces.
    pub(crate) fn set_operation_list(&mut self, ops: &OperationList, full_size: Dimension) {
        self.full_size = Some(full_size);
        self.resulting_size = Some(ops.resulting_size(full_size));
        self.output_format = Some(ops.output_format());
        self.page_number = Some(ops.page());
        self.scale_constraint = Some(ops.scale_constraint());
        self.operation_list = Some(ops.clone());
    }
}
