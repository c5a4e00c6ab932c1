use std::collections::HashMap;
use std::sync::Arc;

use pulse_core::event::ObjectType;
use pulse_core::handler::EventHandler;

/// Maps object types to the handlers interested in them. Handlers run in
/// registration order. Built once at startup, then shared read-only with
/// every channel consumer.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<ObjectType, Vec<Arc<dyn EventHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, object_type: ObjectType, handler: Arc<dyn EventHandler>) {
        self.handlers.entry(object_type).or_default().push(handler);
    }

    /// Handlers for an object type, in registration order. An object type
    /// with no handlers is consumed successfully and contributes nothing.
    pub fn handlers_for(&self, object_type: ObjectType) -> &[Arc<dyn EventHandler>] {
        self.handlers
            .get(&object_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pulse_core::errors::PipelineError;
    use pulse_core::event::ChangeEvent;

    struct Named(&'static str);

    #[async_trait]
    impl EventHandler for Named {
        fn name(&self) -> &str {
            self.0
        }
        async fn handle(&self, _event: &ChangeEvent) -> Result<(), PipelineError> {
            Ok(())
        }
    }

    #[test]
    fn registration_order_preserved() {
        let mut registry = HandlerRegistry::new();
        registry.register(ObjectType::ResponseTask, Arc::new(Named("first")));
        registry.register(ObjectType::ResponseTask, Arc::new(Named("second")));

        let names: Vec<&str> = registry
            .handlers_for(ObjectType::ResponseTask)
            .iter()
            .map(|h| h.name())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn unregistered_type_has_no_handlers() {
        let registry = HandlerRegistry::new();
        assert!(registry.handlers_for(ObjectType::LeadRecord).is_empty());
        assert_eq!(registry.handler_count(), 0);
    }

    #[test]
    fn handlers_separated_by_object_type() {
        let mut registry = HandlerRegistry::new();
        registry.register(ObjectType::ResponseTask, Arc::new(Named("task")));
        registry.register(ObjectType::ResponseMessage, Arc::new(Named("message")));

        assert_eq!(registry.handlers_for(ObjectType::ResponseTask).len(), 1);
        assert_eq!(registry.handlers_for(ObjectType::ResponseMessage).len(), 1);
        assert!(registry.handlers_for(ObjectType::LeadRecord).is_empty());
        assert_eq!(registry.handler_count(), 2);
    }
}
