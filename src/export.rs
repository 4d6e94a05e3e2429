use super::*;

/// On-disk layout of a dump file.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum DumpFormat {
  Json,
  /// Tab separated lines, one per method, types indented below it.
  Text,
  #[default]
  Xml,
}

impl DumpFormat {
  /// Infer the format from a file extension, if it is a known one.
  #[must_use]
  pub fn for_path(path: &Path) -> Option<Self> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    extension.parse().ok()
  }
}

impl std::str::FromStr for DumpFormat {
  type Err = ();

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    match value.trim().to_ascii_lowercase().as_str() {
      "json" => Ok(Self::Json),
      "txt" | "text" | "tsv" => Ok(Self::Text),
      "xml" => Ok(Self::Xml),
      _ => Err(()),
    }
  }
}

impl Snapshot {
  /// Write the snapshot to `path`, with per-type breakdowns when `details`
  /// is set.
  ///
  /// # Errors
  ///
  /// Returns `DumpError::Io` if the file cannot be created or written.
  pub fn dump_to_path(
    &self,
    path: &Path,
    details: bool,
    format: DumpFormat,
  ) -> Result<(), DumpError> {
    let io_error = |source| DumpError::Io {
      path: path.to_path_buf(),
      source,
    };

    let file = File::create(path).map_err(io_error)?;
    let mut writer = BufWriter::new(file);

    match self.write_dump(&mut writer, details, format) {
      Ok(()) => {}
      Err(DumpError::Stream(source)) => return Err(io_error(source)),
      Err(err) => return Err(err),
    }

    writer.flush().map_err(io_error)
  }

  /// Serialize the dump document into any writer.
  ///
  /// # Errors
  ///
  /// Returns an error if the writer fails or JSON encoding fails.
  pub fn write_dump<W: Write>(
    &self,
    writer: &mut W,
    details: bool,
    format: DumpFormat,
  ) -> Result<(), DumpError> {
    match format {
      DumpFormat::Json => {
        let document = DumpDocument::new(self, details);
        serde_json::to_writer_pretty(&mut *writer, &document)?;
        writer.write_all(b"\n")?;
      }
      DumpFormat::Text => write_text(self, writer, details)?,
      DumpFormat::Xml => write_xml(self, writer, details)?,
    }
    Ok(())
  }

  /// Stream this snapshot into the provided writer.
  ///
  /// # Errors
  ///
  /// Returns an error if the downstream writer reports a failure.
  pub fn stream_into<W: SnapshotStreamWriter>(
    &self,
    writer: &mut W,
  ) -> Result<(), DumpError> {
    writer.write_snapshot(self)
  }
}

#[derive(Serialize)]
struct DumpDocument<'a> {
  details: bool,
  methods: Vec<DumpMethod<'a>>,
  total_bytes: u64,
  unattributed_events: u64,
}

#[derive(Serialize)]
struct DumpMethod<'a> {
  delta_bytes: u64,
  name: &'a str,
  stack: &'a str,
  total_bytes: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  types: Option<&'a [TypeRecord]>,
}

impl<'a> DumpDocument<'a> {
  fn new(snapshot: &'a Snapshot, details: bool) -> Self {
    let methods = snapshot
      .records()
      .iter()
      .map(|record| DumpMethod {
        delta_bytes: record.delta_bytes,
        name: record.name.as_ref(),
        stack: record.stack.as_str(),
        total_bytes: record.total_bytes,
        types: details.then_some(record.types.as_slice()),
      })
      .collect();

    Self {
      details,
      methods,
      total_bytes: snapshot.total_bytes(),
      unattributed_events: snapshot.unattributed_events(),
    }
  }
}

fn write_xml<W: Write>(
  snapshot: &Snapshot,
  writer: &mut W,
  details: bool,
) -> io::Result<()> {
  writeln!(writer, r#"<?xml version="1.0" encoding="utf-8"?>"#)?;
  writeln!(
    writer,
    r#"<Allocations methods="{}" totalBytes="{}" unattributed="{}" details="{}">"#,
    snapshot.len(),
    snapshot.total_bytes(),
    snapshot.unattributed_events(),
    details
  )?;

  for record in snapshot.records() {
    let open = format!(
      r#"  <Method name="{}" stack="{}" size="{}" delta="{}""#,
      XmlEscaped(&record.name),
      XmlEscaped(record.stack.as_str()),
      record.total_bytes,
      record.delta_bytes
    );

    if !details {
      writeln!(writer, "{open}/>")?;
      continue;
    }

    writeln!(writer, "{open}>")?;
    for ty in &record.types {
      writeln!(
        writer,
        r#"    <Object name="{}" size="{}"/>"#,
        XmlEscaped(&ty.name),
        ty.bytes
      )?;
    }
    writeln!(writer, "  </Method>")?;
  }

  writeln!(writer, "</Allocations>")
}

fn write_text<W: Write>(
  snapshot: &Snapshot,
  writer: &mut W,
  details: bool,
) -> io::Result<()> {
  for record in snapshot.records() {
    writeln!(
      writer,
      "{}\t\t{}\t{}\t{}",
      record.name, record.total_bytes, record.delta_bytes, record.stack
    )?;

    if details {
      for ty in &record.types {
        writeln!(writer, "\t{}\t{}", ty.name, ty.bytes)?;
      }
    }
  }
  Ok(())
}

struct XmlEscaped<'a>(&'a str);

impl Display for XmlEscaped<'_> {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    for ch in self.0.chars() {
      match ch {
        '&' => f.write_str("&amp;")?,
        '<' => f.write_str("&lt;")?,
        '>' => f.write_str("&gt;")?,
        '"' => f.write_str("&quot;")?,
        '\'' => f.write_str("&apos;")?,
        ch if ch.is_control() && !matches!(ch, '\t' | '\n' | '\r') => {
          write!(f, "&#x{:X};", u32::from(ch))?;
        }
        ch => f.write_char(ch)?,
      }
    }
    Ok(())
  }
}

/// Streaming interface for snapshot consumers.
pub trait SnapshotStreamWriter {
  /// # Errors
  ///
  /// Returns a `DumpError` if the snapshot cannot be serialized or if the
  /// underlying writer fails to persist the data.
  fn write_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), DumpError>;
}

/// JSON lines exporter that writes one JSON object per snapshot.
pub struct JsonLinesWriter<W: Write> {
  writer: W,
}

impl<W: Write> SnapshotStreamWriter for JsonLinesWriter<W> {
  fn write_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), DumpError> {
    let chunk = StreamChunk::new(snapshot);
    serde_json::to_writer(&mut self.writer, &chunk)?;
    self.writer.write_all(b"\n")?;
    Ok(())
  }
}

impl<W: Write> JsonLinesWriter<W> {
  pub fn into_inner(self) -> W {
    self.writer
  }

  pub fn new(writer: W) -> Self {
    Self { writer }
  }
}

#[derive(Serialize)]
struct StreamChunk<'a> {
  records: &'a [MethodRecord],
  #[serde(skip_serializing_if = "Option::is_none")]
  timestamp_ns: Option<u128>,
  total_bytes: u64,
  unattributed_events: u64,
}

impl<'a> StreamChunk<'a> {
  fn new(snapshot: &'a Snapshot) -> Self {
    Self {
      records: snapshot.records(),
      timestamp_ns: system_time_to_nanos(snapshot.taken_at()),
      total_bytes: snapshot.total_bytes(),
      unattributed_events: snapshot.unattributed_events(),
    }
  }
}

fn system_time_to_nanos(ts: SystemTime) -> Option<u128> {
  ts.duration_since(SystemTime::UNIX_EPOCH)
    .ok()
    .map(|duration| duration.as_nanos())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample() -> Snapshot {
    let types = vec![
      TypeRecord {
        bytes: 300,
        name: Arc::from("Foo"),
      },
      TypeRecord {
        bytes: 50,
        name: Arc::from("List<Bar>"),
      },
    ];

    Snapshot::new(
      vec![MethodRecord {
        delta_bytes: 50,
        name: Arc::from("B.Build"),
        site_id: 7,
        stack: CallStackKey::render(&[
          FrameMetadata::parse("B.Build"),
          FrameMetadata::parse("A.Run"),
        ]),
        total_bytes: 350,
        types,
      }],
      2,
    )
  }

  fn render(snapshot: &Snapshot, details: bool, format: DumpFormat) -> String {
    let mut out = Vec::new();
    snapshot
      .write_dump(&mut out, details, format)
      .expect("dump into memory");
    String::from_utf8(out).expect("utf-8 dump")
  }

  #[test]
  fn infers_format_from_extension() {
    let format = |path: &str| DumpFormat::for_path(Path::new(path));

    assert_eq!(format("dump.xml"), Some(DumpFormat::Xml));
    assert_eq!(format("a.JSON"), Some(DumpFormat::Json));
    assert_eq!(format("a.txt"), Some(DumpFormat::Text));
    assert_eq!(format("dump"), None);
    assert_eq!(format("a.bin"), None);
  }

  #[test]
  fn xml_summary_has_no_objects() {
    let xml = render(&sample(), false, DumpFormat::Xml);

    assert!(xml.contains(
      r##"<Method name="B.Build" stack="#0 B.Build -&gt; #1 A.Run" size="350" delta="50"/>"##
    ));
    assert!(!xml.contains("<Object"));
  }

  #[test]
  fn xml_details_escape_type_names() {
    let xml = render(&sample(), true, DumpFormat::Xml);

    assert!(xml.contains(r#"<Object name="Foo" size="300"/>"#));
    assert!(xml.contains(r#"<Object name="List&lt;Bar&gt;" size="50"/>"#));
    assert!(xml.trim_end().ends_with("</Allocations>"));
  }

  #[test]
  fn json_details_toggle_type_breakdown() {
    let summary: serde_json::Value =
      serde_json::from_str(&render(&sample(), false, DumpFormat::Json))
        .expect("valid json");
    assert!(summary["methods"][0].get("types").is_none());
    assert_eq!(summary["methods"][0]["total_bytes"], 350);

    let detailed: serde_json::Value =
      serde_json::from_str(&render(&sample(), true, DumpFormat::Json))
        .expect("valid json");
    let types = detailed["methods"][0]["types"]
      .as_array()
      .expect("types array");
    let sum: u64 = types.iter().filter_map(|ty| ty["bytes"].as_u64()).sum();
    assert_eq!(sum, 350);
  }

  #[test]
  fn text_format_matches_tab_layout() {
    let text = render(&sample(), true, DumpFormat::Text);
    let mut lines = text.lines();

    assert_eq!(
      lines.next(),
      Some("B.Build\t\t350\t50\t#0 B.Build -> #1 A.Run")
    );
    assert_eq!(lines.next(), Some("\tFoo\t300"));
    assert_eq!(lines.next(), Some("\tList<Bar>\t50"));
  }

  #[test]
  fn json_lines_writer_appends_one_object_per_snapshot() {
    let mut writer = JsonLinesWriter::new(Vec::new());
    let snapshot = sample();
    snapshot.stream_into(&mut writer).expect("first chunk");
    snapshot.stream_into(&mut writer).expect("second chunk");

    let output = String::from_utf8(writer.into_inner()).expect("utf-8");
    let lines: Vec<_> = output.lines().collect();
    assert_eq!(lines.len(), 2);

    let chunk: serde_json::Value =
      serde_json::from_str(lines[0]).expect("valid json line");
    assert_eq!(chunk["total_bytes"], 350);
    assert!(chunk["timestamp_ns"].is_u64());
  }

  #[test]
  fn dump_to_unwritable_path_reports_io_failure() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("missing").join("dump.xml");

    let err = sample()
      .dump_to_path(&path, false, DumpFormat::Xml)
      .expect_err("parent directory does not exist");
    assert!(matches!(err, DumpError::Io { .. }));
  }
}
