//! Mediator wiring for the boundary commands

pub use mediator::DefaultAsyncMediator;

use crate::features::FeatureState;

pub type AppMediator = DefaultAsyncMediator;

pub fn build_mediator(state: FeatureState) -> AppMediator {
    DefaultAsyncMediator::builder()
        // Sources
        .add_handler({
            let state = state.clone();
            move |cmd| {
                let state = state.clone();
                async move { crate::features::sources::commands::seed::handle(state, cmd).await }
            }
        })
        .add_handler({
            let state = state.clone();
            move |query| {
                let state = state.clone();
                async move { crate::features::sources::queries::list::handle(state, query).await }
            }
        })
        .add_handler({
            let state = state.clone();
            move |query| {
                let state = state.clone();
                async move { crate::features::sources::queries::get::handle(state, query).await }
            }
        })
        // Jobs
        .add_handler({
            let state = state.clone();
            move |cmd| {
                let state = state.clone();
                async move { crate::features::jobs::commands::run_harvest::handle(state, cmd).await }
            }
        })
        .add_handler({
            let state = state.clone();
            move |cmd| {
                let state = state.clone();
                async move { crate::features::jobs::commands::run_process::handle(state, cmd).await }
            }
        })
        .add_handler({
            let state = state.clone();
            move |cmd| {
                let state = state.clone();
                async move { crate::features::jobs::commands::carry_over::handle(state, cmd).await }
            }
        })
        .add_handler({
            let state = state.clone();
            move |cmd| {
                let state = state.clone();
                async move { crate::features::jobs::commands::schedule::handle(state, cmd).await }
            }
        })
        .add_handler({
            let state = state.clone();
            move |query| {
                let state = state.clone();
                async move { crate::features::jobs::queries::history::handle(state, query).await }
            }
        })
        // Instances
        .add_handler({
            let state = state.clone();
            move |cmd| {
                let state = state.clone();
                async move { crate::features::instances::commands::activate::handle(state, cmd).await }
            }
        })
        .add_handler({
            let state = state.clone();
            move |query| {
                let state = state.clone();
                async move { crate::features::instances::queries::status::handle(state, query).await }
            }
        })
        // Archives
        .add_handler({
            let state = state.clone();
            move |cmd| {
                let state = state.clone();
                async move { crate::features::archives::commands::upload::handle(state, cmd).await }
            }
        })
        // Reports
        .add_handler({
            let state = state.clone();
            move |cmd| {
                let state = state.clone();
                async move { crate::features::reports::commands::create::handle(state, cmd).await }
            }
        })
        .add_handler({
            let state = state.clone();
            move |cmd| {
                let state = state.clone();
                async move { crate::features::reports::commands::delete::handle(state, cmd).await }
            }
        })
        .add_handler({
            let state = state.clone();
            move |cmd| {
                let state = state.clone();
                async move { crate::features::reports::commands::delete_old::handle(state, cmd).await }
            }
        })
        .add_handler({
            let state = state.clone();
            move |query| {
                let state = state.clone();
                async move { crate::features::reports::queries::list::handle(state, query).await }
            }
        })
        .add_handler({
            let state = state.clone();
            move |query| {
                let state = state.clone();
                async move { crate::features::reports::queries::get::handle(state, query).await }
            }
        })
        .add_handler({
            let state = state.clone();
            move |query| {
                let state = state.clone();
                async move { crate::features::reports::queries::artifact::handle(state, query).await }
            }
        })
        .build()
}
