//! Ordered filter pipeline

use tracing::trace;

use super::{DtdEvent, DtdFilter, DtdHandler};
use crate::error::Result;

/// Filters applied in index order, then a terminal handler
///
/// Stages are addressed by position; there are no links between them.
#[derive(Debug)]
pub struct DtdPipeline<H> {
    stages: Vec<Box<dyn DtdFilter + Send>>,
    sink: H,
}

impl<H: DtdHandler> DtdPipeline<H> {
    /// Pipeline with no stages
    pub fn new(sink: H) -> Self {
        Self {
            stages: Vec::new(),
            sink,
        }
    }

    /// Append a stage after the existing ones
    pub fn push(&mut self, stage: Box<dyn DtdFilter + Send>) {
        self.stages.push(stage);
    }

    /// Insert a stage at `index`, shifting later stages down
    ///
    /// An index past the end appends.
    pub fn insert(&mut self, index: usize, stage: Box<dyn DtdFilter + Send>) {
        let index = index.min(self.stages.len());
        trace!(index, ?stage, "inserting DTD stage");
        self.stages.insert(index, stage);
    }

    /// Number of stages, not counting the handler
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the pipeline has no stages
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run one event through every stage and into the handler
    pub fn dispatch(&mut self, event: DtdEvent) -> Result<()> {
        let mut current = event;
        for (index, stage) in self.stages.iter_mut().enumerate() {
            match stage.filter(current)? {
                Some(next) => current = next,
                None => {
                    trace!(index, "event dropped by stage");
                    return Ok(());
                }
            }
        }
        self.sink.handle(current)
    }

    /// The terminal handler
    pub fn sink(&self) -> &H {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtd::EventLog;
    use crate::error::Error;
    use pretty_assertions::assert_eq;

    #[derive(Debug)]
    struct DropComments;

    impl DtdFilter for DropComments {
        fn filter(&mut self, event: DtdEvent) -> Result<Option<DtdEvent>> {
            Ok(match event {
                DtdEvent::Comment(_) => None,
                other => Some(other),
            })
        }
    }

    #[derive(Debug)]
    struct Rename(&'static str);

    impl DtdFilter for Rename {
        fn filter(&mut self, event: DtdEvent) -> Result<Option<DtdEvent>> {
            Ok(Some(match event {
                DtdEvent::ElementDecl { name, content_model } => DtdEvent::ElementDecl {
                    name: format!("{}{}", self.0, name),
                    content_model,
                },
                other => other,
            }))
        }
    }

    #[derive(Debug)]
    struct Fail;

    impl DtdFilter for Fail {
        fn filter(&mut self, _event: DtdEvent) -> Result<Option<DtdEvent>> {
            Err(Error::Dtd("stop".into()))
        }
    }

    fn element(name: &str) -> DtdEvent {
        DtdEvent::ElementDecl {
            name: name.into(),
            content_model: "EMPTY".into(),
        }
    }

    #[test]
    fn test_empty_pipeline_forwards_in_order() {
        let mut pipeline = DtdPipeline::new(EventLog::default());
        let events = vec![element("a"), DtdEvent::Comment("c".into()), DtdEvent::EndDtd];
        for event in events.clone() {
            pipeline.dispatch(event).unwrap();
        }
        assert_eq!(pipeline.sink().events, events);
    }

    #[test]
    fn test_stages_run_by_index() {
        let mut pipeline = DtdPipeline::new(EventLog::default());
        pipeline.push(Box::new(Rename("b-")));
        pipeline.insert(0, Box::new(Rename("a-")));
        pipeline.insert(99, Box::new(DropComments));
        assert_eq!(pipeline.len(), 3);

        pipeline.dispatch(DtdEvent::Comment("x".into())).unwrap();
        pipeline.dispatch(element("e")).unwrap();
        assert_eq!(pipeline.sink().events, vec![element("b-a-e")]);
    }

    #[test]
    fn test_error_stops_dispatch() {
        let mut pipeline = DtdPipeline::new(EventLog::default());
        pipeline.push(Box::new(Fail));
        assert!(pipeline.dispatch(element("a")).is_err());
        assert!(pipeline.sink().events.is_empty());
    }
}
