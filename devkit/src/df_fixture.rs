/*!
Builder for POSIX `df -P` reports

Produces the text a remote host prints for `df -P`, header included, so
tests can feed the collector and parser the same bytes ssh would return.
*/

/// One data row of a `df -P` report, sizes in 1024-byte blocks.
#[derive(Debug, Clone)]
pub struct DfRow {
    pub filesystem: String,
    pub blocks: u64,
    pub used: u64,
    pub available: u64,
    pub mount: String,
}

impl DfRow {
    /// Capacity column as `df` prints it: used / (used + available), rounded up.
    pub fn capacity(&self) -> u64 {
        let denom = self.used + self.available;
        if denom == 0 {
            return 0;
        }
        (self.used * 100).div_ceil(denom)
    }

    pub fn render(&self) -> String {
        format!(
            "{:<24} {:>12} {:>12} {:>12} {:>8}% {}",
            self.filesystem,
            self.blocks,
            self.used,
            self.available,
            self.capacity(),
            self.mount
        )
    }
}

/// Assembles a full report line by line.
#[derive(Debug, Clone, Default)]
pub struct DfReportBuilder {
    rows: Vec<DfRow>,
    raw_lines: Vec<String>,
    with_header: bool,
}

impl DfReportBuilder {
    pub fn new() -> Self {
        Self {
            rows: Vec::new(),
            raw_lines: Vec::new(),
            with_header: true,
        }
    }

    /// Omit the `Filesystem 1024-blocks ...` header line.
    pub fn without_header(mut self) -> Self {
        self.with_header = false;
        self
    }

    /// Add a well-formed partition row; the filesystem name is derived from the mount.
    pub fn partition(mut self, mount: &str, blocks: u64, used: u64, available: u64) -> Self {
        let device = format!("/dev/{}", mount.trim_start_matches('/').replace('/', "_"));
        let filesystem = if mount == "/" { "/dev/root".to_string() } else { device };
        self.rows.push(DfRow {
            filesystem,
            blocks,
            used,
            available,
            mount: mount.to_string(),
        });
        self
    }

    /// Add a row with an explicit filesystem column (NFS exports and the like).
    pub fn row(mut self, filesystem: &str, mount: &str, blocks: u64, used: u64, available: u64) -> Self {
        self.rows.push(DfRow {
            filesystem: filesystem.to_string(),
            blocks,
            used,
            available,
            mount: mount.to_string(),
        });
        self
    }

    /// Append a line verbatim, e.g. to inject malformed output.
    pub fn raw_line(mut self, line: &str) -> Self {
        self.raw_lines.push(line.to_string());
        self
    }

    pub fn rows(&self) -> &[DfRow] {
        &self.rows
    }

    pub fn build(&self) -> String {
        let mut out = String::new();
        if self.with_header {
            out.push_str("Filesystem               1024-blocks         Used    Available Capacity Mounted on\n");
        }
        for row in &self.rows {
            out.push_str(&row.render());
            out.push('\n');
        }
        for line in &self.raw_lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    /// Data lines only, header stripped, as the collector hands them to the parser.
    pub fn data_lines(&self) -> Vec<String> {
        self.build()
            .lines()
            .skip(usize::from(self.with_header))
            .map(str::to_string)
            .collect()
    }
}
