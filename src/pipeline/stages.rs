//! Generate, describe and grade: one model call each over `PipelineState`.

use std::collections::HashMap;

use uuid::Uuid;

use crate::gateway::Attribution;
use crate::model::{Completion, ModelClient, ModelTier};
use crate::prompts::{build_prompt, Stage};

use super::state::{Grade, PipelineState};
use super::PipelineError;

/// What a stage needs besides the state itself.
pub struct StageContext<'a> {
    pub client: &'a dyn ModelClient,
    pub schema: &'a str,
    pub session_id: &'a str,
    pub run_id: Uuid,
}

impl StageContext<'_> {
    fn attribution(&self, caller: &'static str) -> Attribution {
        Attribution::new(caller)
            .with_run(self.run_id)
            .with_session(self.session_id)
    }
}

/// Record of one completed stage call.
#[derive(Debug, Clone)]
pub struct StageCall {
    pub stage: Stage,
    pub tier: ModelTier,
    pub template_slug: &'static str,
    pub completion: Completion,
    pub grade: Option<Grade>,
}

/// Write a SQL query for the question, on the higher-power model once the
/// session has escalated. The raw model text is stored unvalidated.
pub async fn generate(
    ctx: &StageContext<'_>,
    state: &mut PipelineState,
) -> Result<StageCall, PipelineError> {
    let prompt = {
        let vars = HashMap::from([
            ("table_description", ctx.schema),
            ("question", state.question.as_str()),
        ]);
        build_prompt(Stage::Generate, &vars)?
    };
    let tier = ModelTier::from_escalate(state.escalate);

    let completion = ctx
        .client
        .complete(&prompt, tier, ctx.attribution("pipeline::generate"))
        .await?;

    state.record_generation(completion.text.clone());

    Ok(StageCall {
        stage: Stage::Generate,
        tier,
        template_slug: prompt.template_slug,
        completion,
        grade: None,
    })
}

/// Describe what the current query does. Always the default model.
pub async fn describe(
    ctx: &StageContext<'_>,
    state: &mut PipelineState,
) -> Result<StageCall, PipelineError> {
    let prompt = {
        let mut vars = HashMap::from([("table_description", ctx.schema)]);
        if let Some(sql) = state.sql_query.as_deref() {
            vars.insert("sql_query", sql);
        }
        build_prompt(Stage::Describe, &vars)?
    };
    let tier = ModelTier::Default;

    let completion = ctx
        .client
        .complete(&prompt, tier, ctx.attribution("pipeline::describe"))
        .await?;

    state.record_description(completion.text.clone());

    Ok(StageCall {
        stage: Stage::Describe,
        tier,
        template_slug: prompt.template_slug,
        completion,
        grade: None,
    })
}

/// Ask whether the description answers the question. Always the default model.
pub async fn grade(
    ctx: &StageContext<'_>,
    state: &mut PipelineState,
) -> Result<StageCall, PipelineError> {
    let prompt = {
        let mut vars = HashMap::from([
            ("table_description", ctx.schema),
            ("question", state.question.as_str()),
        ]);
        if let Some(steps) = state.description.as_deref() {
            vars.insert("steps", steps);
        }
        build_prompt(Stage::Grade, &vars)?
    };
    let tier = ModelTier::Default;

    let completion = ctx
        .client
        .complete(&prompt, tier, ctx.attribution("pipeline::grade"))
        .await?;

    let grade = Grade::from_response(&completion.text);
    state.record_grade(grade);

    Ok(StageCall {
        stage: Stage::Grade,
        tier,
        template_slug: prompt.template_slug,
        completion,
        grade: Some(grade),
    })
}
