use std::sync::Arc;

use async_trait::async_trait;
use promptkit_contracts::{Prompt, StreamElement, ToolDescriptor};
use tokio::sync::mpsc;

use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::stage::Stage;
use crate::traits::TemplateRenderer;

/// Renders the selected prompt's system template against the context's
/// variables and resolves its declared tool names into full descriptors.
/// Variables declared `required` on the prompt but absent from the context
/// are a config error, caught here rather than silently rendering `{{var}}`
/// literally into the prompt.
pub struct TemplateStage {
    renderer: Arc<dyn TemplateRenderer>,
    prompt: Prompt,
    tools: Vec<ToolDescriptor>,
}

impl TemplateStage {
    pub fn new(renderer: Arc<dyn TemplateRenderer>, prompt: Prompt, tools: Vec<ToolDescriptor>) -> Self {
        Self { renderer, prompt, tools }
    }
}

#[async_trait]
impl Stage for TemplateStage {
    fn name(&self) -> &str {
        "template_render"
    }

    async fn process(
        &self,
        mut input: mpsc::Receiver<StreamElement>,
        output: mpsc::Sender<StreamElement>,
        ctx: Arc<ExecutionContext>,
    ) -> Result<()> {
        let variables = ctx.variables().await;
        for variable in &self.prompt.variables {
            if variable.required && !variables.contains_key(&variable.name) {
                return Err(Error::config(format!(
                    "prompt '{}' requires variable '{}'",
                    self.prompt.name, variable.name
                )));
            }
        }

        let rendered = self.renderer.render(&self.prompt.system_template, &variables)?;
        ctx.set_system_prompt(rendered).await;
        ctx.set_tool_defs(self.tools.clone()).await;

        while let Some(element) = input.recv().await {
            if ctx.cancellation.is_cancelled() {
                break;
            }
            if output.send(element).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::NoOpEventBus;
    use crate::memory::SimpleTemplateRenderer;
    use promptkit_contracts::PromptParameters;
    use uuid::Uuid;

    fn prompt() -> Prompt {
        Prompt {
            id: "p1".into(),
            name: "chat".into(),
            version: "1".into(),
            system_template: "You are {{persona}}.".into(),
            variables: vec![],
            parameters: PromptParameters::default(),
            tools: vec![],
        }
    }

    #[tokio::test]
    async fn renders_system_prompt_from_variables() {
        let ctx = Arc::new(ExecutionContext::new(Uuid::now_v7(), None, false, Arc::new(NoOpEventBus)));
        ctx.set_variable("persona", "a helpful assistant").await;
        let stage = TemplateStage::new(Arc::new(SimpleTemplateRenderer), prompt(), vec![]);
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        let (out_tx, _out_rx) = mpsc::channel(1);
        stage.process(rx, out_tx, ctx.clone()).await.unwrap();
        assert_eq!(
            ctx.system_prompt().await.as_deref(),
            Some("You are a helpful assistant.")
        );
    }
}
