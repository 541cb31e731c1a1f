/// A type which can produce a compact, single-line summary of itself for
/// tracing output.
///
/// `Debug` output of entry batches and requests is too noisy for logs that
/// are read under time pressure; summaries carry only the fields that matter
/// when following a replication or election trace.
pub trait MessageSummary {
    fn summary(&self) -> String;
}

impl<T: MessageSummary> MessageSummary for Option<T> {
    fn summary(&self) -> String {
        match self {
            None => "None".to_string(),
            Some(x) => format!("Some({})", x.summary()),
        }
    }
}

impl<T: MessageSummary> MessageSummary for &[T] {
    fn summary(&self) -> String {
        self.iter().map(|x| x.summary()).collect::<Vec<_>>().join(",")
    }
}
