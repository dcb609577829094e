//! End-to-end training simulation
//!
//! Runs a toy training loop that checkpoints on an interval, is interrupted,
//! and resumes from the latest checkpoint. The resumed run must end in the
//! same state as an uninterrupted one.

use std::sync::Arc;

use anyhow::{Context, Result};
use checkpoint::{
    BlockingCheckpointManager, CheckpointManager, CheckpointManagerConfig, CheckpointManagerHandle,
    SaveOptions,
};
use ckpt_core::{ArrayValue, Node, RetentionPolicy, SaveMode, StateTree, Step};
use tempfile::TempDir;

const WIDTH: usize = 8;

/// Parameters and optimizer momentum of a tiny model
struct Trainer {
    weights: Vec<f32>,
    momentum: Vec<f32>,
    step: Step,
}

impl Trainer {
    fn new() -> Self {
        Self {
            weights: vec![1.0; WIDTH],
            momentum: vec![0.0; WIDTH],
            step: 0,
        }
    }

    fn train_step(&mut self) {
        self.step += 1;
        for i in 0..WIDTH {
            let grad = (self.weights[i] - i as f32) * 0.1;
            self.momentum[i] = 0.9 * self.momentum[i] + grad;
            self.weights[i] -= 0.05 * self.momentum[i];
        }
    }

    fn to_tree(&self) -> StateTree {
        StateTree::new()
            .with(
                "params",
                StateTree::new().with("w", ArrayValue::from_f32(vec![WIDTH], &self.weights).unwrap()),
            )
            .with(
                "opt_state",
                Node::List(vec![
                    Node::from(ArrayValue::from_f32(vec![WIDTH], &self.momentum).unwrap()),
                    Node::from(0.9),
                ]),
            )
            .with("step", self.step as i64)
    }

    fn from_tree(tree: &StateTree) -> Result<Self> {
        let weights = tree
            .get_path("params/w")
            .and_then(Node::as_array)
            .context("params/w")?
            .to_f32()?;
        let momentum = tree
            .get_path("opt_state/0")
            .and_then(Node::as_array)
            .context("opt_state/0")?
            .to_f32()?;
        let step = match tree.get("step").and_then(Node::as_scalar) {
            Some(ckpt_core::Scalar::Int(step)) => *step as Step,
            other => anyhow::bail!("unexpected step field: {:?}", other),
        };
        Ok(Self {
            weights,
            momentum,
            step,
        })
    }
}

fn uninterrupted(total: Step) -> Trainer {
    let mut trainer = Trainer::new();
    while trainer.step < total {
        trainer.train_step();
    }
    trainer
}

#[test]
fn test_interrupted_training_resumes_exactly() -> Result<()> {
    let dir = TempDir::new()?;
    let config = CheckpointManagerConfig::new(dir.path())
        .with_policy(RetentionPolicy::keep_last(3))
        .with_save_mode(SaveMode::Async)
        .with_save_interval(10);

    // First run stops at step 57, after the step-50 checkpoint
    {
        let manager = BlockingCheckpointManager::new(config.clone())?;
        let mut trainer = Trainer::new();
        while trainer.step < 57 {
            trainer.train_step();
            if manager.should_save(trainer.step) {
                manager.save(&trainer.to_tree(), trainer.step)?;
            }
        }
        manager.wait_until_finished()?;
        assert_eq!(manager.all_steps(), vec![30, 40, 50]);
    }

    // Second run picks up from the latest retained step
    let manager = BlockingCheckpointManager::new(config)?;
    let template = Trainer::new().to_tree().shape();
    let restored = manager.restore(None, Some(&template))?;
    let mut trainer = Trainer::from_tree(&restored)?;
    assert_eq!(trainer.step, 50);

    while trainer.step < 100 {
        trainer.train_step();
        if manager.should_save(trainer.step) {
            manager.save(&trainer.to_tree(), trainer.step)?;
        }
    }
    manager.close()?;

    let expected = uninterrupted(100);
    assert_eq!(trainer.weights, expected.weights);
    assert_eq!(trainer.momentum, expected.momentum);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shared_handle_across_tasks() -> Result<()> {
    let dir = TempDir::new()?;
    let config = CheckpointManagerConfig::new(dir.path())
        .with_policy(RetentionPolicy::unbounded())
        .with_save_mode(SaveMode::Async);
    let manager: CheckpointManagerHandle = Arc::new(CheckpointManager::new(config).await?);

    // Training task produces checkpoints; an evaluator restores whatever is latest
    let trainer = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let mut trainer = Trainer::new();
            for _ in 0..5 {
                trainer.train_step();
                let options = SaveOptions::default().with_metadata("phase", "train");
                let handle = manager.save_async(&trainer.to_tree(), trainer.step, options).await?;
                handle.wait().await?;
            }
            anyhow::Ok(trainer.step)
        })
    };

    let last = trainer.await??;
    manager.wait_until_finished().await?;

    let template = Trainer::new().to_tree().shape();
    let restored = manager.restore(None, Some(&template)).await?;
    assert_eq!(Trainer::from_tree(&restored)?.step, last);
    assert_eq!(manager.all_steps(), (1..=5).collect::<Vec<Step>>());
    assert!(manager
        .entries()
        .iter()
        .all(|e| e.metadata.get("phase").map(String::as_str) == Some("train")));
    Ok(())
}
