//! Graph finalization and the task executor.
//!
//! `GraphSession::new` turns a graph into an ordered list of tasks:
//!
//! 1. shape propagation over the whole graph
//! 2. the concat sub-tensor mutator, when enabled
//! 3. a stable topological sort; every enabled compute node becomes a task
//! 4. one arena tensor per node output, pooled over its lifetime
//! 5. method selection and function instantiation per task
//! 6. memory planning (`GraphContext::finalize`), const accessors, `prepare`
//!
//! `run` then replays the tasks in order, any number of times.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, info_span, warn};

use kiln_core::{ConvolutionMethod, KilnError, Result, Target, TensorDescriptor, Window};
use kiln_memory::{Interval, MemoryGroup, MemoryManager, TensorArena, TensorHandle, TensorView};
use kiln_runtime::{Function, RunContext};

use crate::accessor::Accessor;
use crate::config::GraphConfig;
use crate::context::GraphContext;
use crate::graph::Graph;
use crate::hooks::{ExecutionHook, TaskInfo};
use crate::mutators::{ConcatSubTensorMutator, SubTensorConcat};
use crate::node::{NodeId, NodeOutput, NodeType};
use crate::ops::{node_ops, InstantiateArgs};

/// One node bound to its instantiated function.
pub struct ExecutionTask {
    node: NodeId,
    name: String,
    node_type: NodeType,
    target: Target,
    method: Option<ConvolutionMethod>,
    group: MemoryGroup,
    function: Box<dyn Function>,
}

impl ExecutionTask {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// Convolution method in use, for convolution tasks.
    pub fn method(&self) -> Option<ConvolutionMethod> {
        self.method
    }

    pub fn function(&self) -> &dyn Function {
        self.function.as_ref()
    }

    pub fn windows(&self) -> Vec<Window> {
        self.function.windows()
    }
}

impl std::fmt::Debug for ExecutionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionTask")
            .field("node", &self.node)
            .field("name", &self.name)
            .field("target", &self.target)
            .field("method", &self.method)
            .field("state", &self.function.state())
            .finish()
    }
}

struct BoundAccessor {
    node: NodeId,
    tensor: TensorHandle,
    accessor: Box<dyn Accessor>,
}

/// Storage plan of one root tensor (a tensor that is not a sub-tensor).
#[derive(Debug, Default)]
struct RootSpan {
    start: Option<usize>,
    end: usize,
    owned: bool,
}

fn group_name(name: &str, id: NodeId) -> String {
    format!("{name}#{}", id.raw())
}

/// A finalized graph, ready to run.
pub struct GraphSession {
    graph: Graph,
    ctx: GraphContext,
    arena: TensorArena,
    tensors: HashMap<NodeOutput, TensorHandle>,
    targets: Vec<Target>,
    subtensors: Vec<SubTensorConcat>,
    tasks: Vec<ExecutionTask>,
    inputs: Vec<BoundAccessor>,
    outputs: Vec<BoundAccessor>,
    hooks: Vec<Box<dyn ExecutionHook>>,
    runs: u64,
}

impl std::fmt::Debug for GraphSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphSession")
            .field("graph", &self.graph.name())
            .field("tasks", &self.tasks)
            .field("tensors", &self.arena.len())
            .field("runs", &self.runs)
            .finish()
    }
}

impl GraphSession {
    /// Finalize `graph` with a fresh context built from `config`.
    pub fn with_config(graph: Graph, config: GraphConfig) -> Result<Self> {
        Self::new(graph, GraphContext::new(config))
    }

    /// Finalize `graph` under `ctx`. Backends missing from the context are
    /// created from its configuration.
    pub fn new(mut graph: Graph, mut ctx: GraphContext) -> Result<Self> {
        let started = Instant::now();
        graph.propagate_shapes()?;
        let subtensors = if ctx.config().use_subtensors {
            ConcatSubTensorMutator.mutate(&mut graph)?
        } else {
            Vec::new()
        };

        let default_target = ctx.config().default_target;
        let targets: Vec<Target> = graph
            .nodes()
            .iter()
            .map(|n| n.params().target.unwrap_or(default_target))
            .collect();

        let mut task_nodes = Vec::new();
        let mut step_of: HashMap<NodeId, usize> = HashMap::new();
        for id in graph.topological_order()? {
            let node = graph.get(id)?;
            if node_ops(node.node_type()).instantiate.is_none() {
                continue;
            }
            ctx.ensure_backend(targets[id.index()])?;
            if node.is_enabled() {
                step_of.insert(id, task_nodes.len());
                task_nodes.push(id);
            }
        }

        let mut session = Self {
            graph,
            ctx,
            arena: TensorArena::new(),
            tensors: HashMap::new(),
            targets,
            subtensors,
            tasks: Vec::with_capacity(task_nodes.len()),
            inputs: Vec::new(),
            outputs: Vec::new(),
            hooks: Vec::new(),
            runs: 0,
        };
        session.create_tensors(&step_of)?;
        for (step, &id) in task_nodes.iter().enumerate() {
            let task = session.instantiate(id, step)?;
            session.tasks.push(task);
        }
        session.ctx.finalize()?;
        session.bind_accessors()?;
        session.prepare()?;

        info!(
            graph = session.graph.name(),
            nodes = session.graph.len(),
            tasks = session.tasks.len(),
            tensors = session.arena.len(),
            subtensor_concats = session.subtensors.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "graph finalized"
        );
        Ok(session)
    }

    fn desc_for(&self, output: NodeOutput) -> Result<TensorDescriptor> {
        let desc = self
            .graph
            .output_desc(output)
            .ok_or_else(|| KilnError::shape(format!("output {} of {} has no descriptor", output.index, output.node)))?;
        Ok(desc.clone().with_target(self.targets[output.node.index()]))
    }

    /// One tensor per node output. Sources and tensors read by Output nodes
    /// get dedicated storage; everything else is pooled over
    /// `[producer task, last consumer task + 1)`, per storage root.
    fn create_tensors(&mut self, step_of: &HashMap<NodeId, usize>) -> Result<()> {
        let mut root_of: HashMap<NodeOutput, NodeOutput> = HashMap::new();
        for sc in &self.subtensors {
            for &input in &sc.inputs {
                root_of.insert(input, NodeOutput::new(sc.node, 0));
            }
        }

        let mut spans: HashMap<NodeOutput, RootSpan> = HashMap::new();
        let mut order: Vec<NodeOutput> = Vec::new();
        for id in self.graph.topological_order()? {
            let node = self.graph.get(id)?;
            for index in 0..node.num_outputs() {
                let output = NodeOutput::new(id, index);
                order.push(output);
                let root = root_of.get(&output).copied().unwrap_or(output);
                let span = spans.entry(root).or_default();
                if matches!(node.node_type(), NodeType::Input | NodeType::Const) {
                    span.owned = true;
                }
                if let Some(&step) = step_of.get(&id) {
                    span.start = Some(span.start.map_or(step, |s| s.min(step)));
                    span.end = span.end.max(step + 1);
                }
                for consumer in self.graph.output_consumers(output) {
                    let Some(c) = self.graph.node(consumer) else { continue };
                    if c.node_type() == NodeType::Output {
                        span.owned = true;
                    } else if let Some(&step) = step_of.get(&consumer) {
                        span.end = span.end.max(step + 1);
                    }
                }
            }
        }

        for &output in &order {
            let node = self.graph.get(output.node)?;
            let name = if node.num_outputs() == 1 {
                node.name().to_string()
            } else {
                format!("{}:{}", node.name(), output.index)
            };
            let group = group_name(node.name(), output.node);
            let desc = self.desc_for(output)?;
            let h = self.arena.add(name, desc.clone());
            self.tensors.insert(output, h);
            if root_of.contains_key(&output) {
                continue;
            }
            match spans.get(&output) {
                Some(RootSpan {
                    start: Some(start),
                    end,
                    owned: false,
                }) => {
                    let target = self.targets[output.node.index()];
                    let manager = self.manager(target)?;
                    let lifetime = Interval::new(*start, *end);
                    let key = format!("out{}", output.index);
                    let alloc = manager.request(&group, &key, desc.total_bytes(), lifetime)?;
                    self.arena.bind_managed(h, manager, alloc)?;
                }
                _ => self.arena.bind_owned(h)?,
            }
        }
        self.bind_subtensors()
    }

    fn bind_subtensors(&mut self) -> Result<()> {
        for sc in &self.subtensors {
            let parent = self.handle(NodeOutput::new(sc.node, 0))?;
            for (input, offsets) in sc.inputs.iter().zip(sc.offsets(&self.graph)?) {
                let h = self.handle(*input)?;
                self.arena.bind_sub(h, parent, &offsets)?;
            }
        }
        Ok(())
    }

    fn manager(&self, target: Target) -> Result<Arc<MemoryManager>> {
        self.ctx
            .memory_management_ctx(target)
            .map(|c| Arc::clone(&c.manager))
            .ok_or_else(|| KilnError::usage(format!("no memory manager for target {target}")))
    }

    fn handle(&self, output: NodeOutput) -> Result<TensorHandle> {
        self.tensors
            .get(&output)
            .copied()
            .ok_or_else(|| KilnError::usage(format!("no tensor for output {} of {}", output.index, output.node)))
    }

    fn instantiate(&mut self, id: NodeId, step: usize) -> Result<ExecutionTask> {
        let node = self.graph.get(id)?;
        let target = self.targets[id.index()];
        let name = node.name().to_string();
        let wrap = |e: KilnError| e.at_node(id.raw(), &name);

        let instantiate = node_ops(node.node_type())
            .instantiate
            .ok_or_else(|| KilnError::usage(format!("{} nodes do not run", node.node_type())))
            .map_err(wrap)?;
        let inputs: Vec<TensorHandle> = node.inputs().iter().map(|&i| self.handle(i)).collect::<Result<_>>()?;
        let input_descs: Vec<TensorDescriptor> = node
            .inputs()
            .iter()
            .map(|&i| self.desc_for(i))
            .collect::<Result<_>>()
            .map_err(wrap)?;
        let output = self.handle(NodeOutput::new(id, 0))?;
        let output_desc = self.desc_for(NodeOutput::new(id, 0))?;

        let args = InstantiateArgs {
            scheduler: self.ctx.scheduler(target)?,
            target,
            inputs: &inputs,
            input_descs: &input_descs,
            output,
            output_desc: &output_desc,
            policy: self.ctx.config().method_hint_policy,
        };
        let built = instantiate(node.kind(), &args).map_err(wrap)?;
        let node_type = node.node_type();

        let group = MemoryGroup::new(self.manager(target)?, group_name(&name, id), Interval::at(step));
        let mut function = built.function;
        function.configure(&mut self.arena, &group).map_err(wrap)?;
        debug!(
            node = %id,
            name = %name,
            kind = %node_type,
            %target,
            method = ?built.method,
            output = %output_desc.shape,
            step,
            "node instantiated"
        );
        Ok(ExecutionTask {
            node: id,
            name,
            node_type,
            target,
            method: built.method,
            group,
            function,
        })
    }

    /// Run const accessors once and keep input / output accessors.
    fn bind_accessors(&mut self) -> Result<()> {
        let ids: Vec<NodeId> = self.graph.nodes().iter().map(|n| n.id()).collect();
        for id in ids {
            let node_type = self.graph.get(id)?.node_type();
            let tensor = match node_type {
                NodeType::Input | NodeType::Const => self.handle(NodeOutput::new(id, 0))?,
                NodeType::Output => {
                    let input = self.graph.get(id)?.inputs()[0];
                    self.handle(input)?
                }
                _ => continue,
            };
            let Some(mut accessor) = self.graph.take_accessor(id)? else { continue };
            match node_type {
                NodeType::Const => {
                    if !accessor.access(&self.arena.view(tensor)?) {
                        let name = self.graph.get(id)?.name().to_string();
                        return Err(KilnError::resource("const accessor failed").at_node(id.raw(), &name));
                    }
                }
                NodeType::Input => self.inputs.push(BoundAccessor { node: id, tensor, accessor }),
                _ => self.outputs.push(BoundAccessor { node: id, tensor, accessor }),
            }
        }
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        for (step, task) in self.tasks.iter_mut().enumerate() {
            task.function
                .prepare(&RunContext::new(&self.arena, step))
                .map_err(|e| e.at_node(task.node.raw(), &task.name))?;
        }
        Ok(())
    }

    /// Run every task once.
    ///
    /// Returns `Ok(false)` when an input accessor had no data (nothing runs)
    /// or an output accessor refused the result.
    pub fn run(&mut self) -> Result<bool> {
        for bound in &mut self.inputs {
            if !bound.accessor.access(&self.arena.view(bound.tensor)?) {
                info!(node = %bound.node, "input accessor returned no data");
                return Ok(false);
            }
        }

        let gpu = self.ctx.scheduler(Target::Gpu).ok();
        let mut previous: Option<Target> = None;
        for (step, task) in self.tasks.iter_mut().enumerate() {
            if previous == Some(Target::Gpu) && task.target == Target::Cpu {
                if let Some(gpu) = &gpu {
                    gpu.sync()?;
                }
            }
            previous = Some(task.target);

            let span = info_span!("task", node = %task.node, name = %task.name, step);
            let _enter = span.enter();
            let info = TaskInfo {
                step,
                node: task.node,
                name: &task.name,
                node_type: task.node_type,
                target: task.target,
            };
            for hook in self.hooks.iter_mut() {
                hook.on_task_start(&info);
            }
            let started = Instant::now();
            let result = task.function.run(&RunContext::new(&self.arena, step));
            let elapsed = started.elapsed();
            for hook in self.hooks.iter_mut() {
                hook.on_task_end(&info, elapsed, result.as_ref().map(|_| ()));
            }
            if let Err(e) = result {
                error!(error = %e, "task failed");
                // Drain in-flight work; the task error is the one reported.
                if let Err(sync) = self.ctx.sync_all() {
                    warn!(error = %sync, "sync after failed task");
                }
                return Err(e.at_node(task.node.raw(), &task.name));
            }
        }
        self.ctx.sync_all()?;

        let mut accepted = true;
        for bound in &mut self.outputs {
            if !bound.accessor.access(&self.arena.view(bound.tensor)?) {
                warn!(node = %bound.node, "output accessor refused the result");
                accepted = false;
            }
        }
        self.runs += 1;
        Ok(accepted)
    }

    /// Change the descriptor of an Input node and re-derive everything that
    /// depends on it: shapes, tensor sizes, pooled memory and every function.
    pub fn resize_input(&mut self, input: NodeId, desc: TensorDescriptor) -> Result<()> {
        self.graph.set_input_desc(input, desc)?;
        self.graph.propagate_shapes()?;

        let outputs: Vec<(NodeOutput, TensorHandle)> = self.tensors.iter().map(|(&o, &h)| (o, h)).collect();
        for (output, h) in outputs {
            let desc = self.desc_for(output)?;
            self.arena.set_desc(h, desc)?;
        }
        self.bind_subtensors()?;

        for task in &mut self.tasks {
            task.function
                .configure(&mut self.arena, &task.group)
                .map_err(|e| e.at_node(task.node.raw(), &task.name))?;
        }
        for target in self.ctx.targets().collect::<Vec<_>>() {
            let manager = self.manager(target)?;
            if manager.needs_refinalize() {
                info!(%target, "re-planning memory after resize");
                manager.refinalize()?;
            }
        }
        debug!(node = %input, "input resized");
        Ok(())
    }

    /// Install a hook. Hooks run in installation order.
    pub fn add_hook(&mut self, hook: impl ExecutionHook + 'static) {
        self.hooks.push(Box::new(hook));
    }

    pub fn tasks(&self) -> &[ExecutionTask] {
        &self.tasks
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn context(&self) -> &GraphContext {
        &self.ctx
    }

    pub fn arena(&self) -> &TensorArena {
        &self.arena
    }

    pub fn runs(&self) -> u64 {
        self.runs
    }

    pub fn memory_manager(&self, target: Target) -> Option<Arc<MemoryManager>> {
        self.manager(target).ok()
    }

    pub fn subtensor_concats(&self) -> &[SubTensorConcat] {
        &self.subtensors
    }

    pub fn tensor(&self, output: impl Into<NodeOutput>) -> Option<TensorHandle> {
        self.tensors.get(&output.into()).copied()
    }

    /// View of a node output. Pooled tensors only hold meaningful data
    /// while their task range runs; read owned tensors (sources, tensors
    /// feeding Output nodes) between runs.
    pub fn view(&self, output: impl Into<NodeOutput>) -> Result<TensorView> {
        self.arena.view(self.handle(output.into())?)
    }

    /// View of the tensor an Output node reads.
    pub fn output_view(&self, node: NodeId) -> Result<TensorView> {
        let n = self.graph.get(node)?;
        if n.node_type() != NodeType::Output {
            return Err(KilnError::usage(format!("node {node} ({}) is not an output", n.name())));
        }
        self.view(n.inputs()[0])
    }

    /// Write the tuner cache to the configured file.
    pub fn save_tuner(&self) -> Result<()> {
        self.ctx.save_tuner()
    }
}

impl Drop for GraphSession {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.save_tuner() {
            warn!(error = %e, "could not save tuner cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::{CaptureAccessor, ConstantAccessor, VecAccessor};
    use crate::builder::{add_activation_node, add_elementwise_node, add_input_node, add_output_node};
    use crate::node::NodeParams;
    use kiln_core::{ActivationFunction, ActivationInfo, DataType, Dimension, EltwiseOperation};
    use kiln_runtime::{ExecutionContext, FunctionState, Hints, Kernel, Scheduler, TensorPack};

    fn config() -> GraphConfig {
        GraphConfig::default().with_num_threads(2)
    }

    /// x -> relu -> (+ x) -> out
    fn residual() -> (Graph, NodeId, NodeId, CaptureAccessor) {
        let mut g = Graph::new("residual");
        let x = add_input_node(
            &mut g,
            NodeParams::new("x"),
            TensorDescriptor::new([1, 4], DataType::F32),
            Some(Box::new(VecAccessor::new(vec![-1.0, 2.0, -3.0, 4.0]))),
        )
        .unwrap();
        let relu = ActivationInfo::new(ActivationFunction::Relu);
        let a = add_activation_node(&mut g, NodeParams::new("relu"), x.into(), relu).unwrap();
        let sum = add_elementwise_node(&mut g, NodeParams::new("sum"), a.into(), x.into(), EltwiseOperation::Add)
            .unwrap();
        let cap = CaptureAccessor::new();
        let out = add_output_node(&mut g, NodeParams::new("out"), sum.into(), Some(Box::new(cap.clone()))).unwrap();
        (g, a, out, cap)
    }

    #[test]
    fn test_run_residual() {
        let (g, _, out, cap) = residual();
        let mut session = GraphSession::with_config(g, config()).unwrap();
        assert_eq!(session.tasks().len(), 2);
        assert!(session.run().unwrap());
        assert_eq!(cap.values(), vec![-1.0, 4.0, -3.0, 8.0]);
        assert_eq!(session.output_view(out).unwrap().to_vec_f32(), cap.values());
        assert_eq!(session.runs(), 1);
    }

    #[test]
    fn test_lifetimes() {
        let (g, a, _, _) = residual();
        let session = GraphSession::with_config(g, config()).unwrap();
        let relu_out = session.tensor(a).unwrap();
        // Produced by task 0, last read by task 1.
        assert_eq!(session.arena().lifetime(relu_out).unwrap(), Some(Interval::new(0, 2)));
        // The sum feeds an Output node and is owned.
        let sum = session.tasks()[1].node();
        assert_eq!(session.arena().lifetime(session.tensor(sum).unwrap()).unwrap(), None);
    }

    #[test]
    fn test_input_accessor_without_data() {
        let mut g = Graph::new("g");
        let x = add_input_node(
            &mut g,
            NodeParams::new("x"),
            TensorDescriptor::new([3], DataType::F32),
            Some(Box::new(|_: &TensorView| false)),
        )
        .unwrap();
        let relu = ActivationInfo::new(ActivationFunction::Relu);
        let a = add_activation_node(&mut g, NodeParams::new("relu"), x.into(), relu).unwrap();
        add_output_node(&mut g, NodeParams::new("out"), a.into(), Some(Box::new(ConstantAccessor::new(0.0)))).unwrap();
        let mut session = GraphSession::with_config(g, config()).unwrap();
        assert!(!session.run().unwrap());
        assert_eq!(session.runs(), 0);
    }

    struct DeviceFault(Window);

    impl Kernel for DeviceFault {
        fn name(&self) -> &str {
            "device_fault"
        }
        fn window(&self) -> &Window {
            &self.0
        }
        fn run(&self, _: &Window, _: &ExecutionContext<'_>) -> Result<()> {
            Err(KilnError::resource("device fault"))
        }
    }

    /// Leaves a failing launch on the GPU queue, then fails itself.
    struct Faulty {
        gpu: Arc<dyn Scheduler>,
    }

    impl Function for Faulty {
        fn name(&self) -> &str {
            "faulty"
        }
        fn state(&self) -> FunctionState {
            FunctionState::Prepared
        }
        fn configure(&mut self, _: &mut TensorArena, _: &MemoryGroup) -> Result<()> {
            Ok(())
        }
        fn prepare(&mut self, _: &RunContext<'_>) -> Result<()> {
            Ok(())
        }
        fn run(&mut self, _: &RunContext<'_>) -> Result<()> {
            let mut window = Window::new(1);
            window.set(0, Dimension::new(0, 4, 1));
            let kernel: Arc<dyn Kernel> = Arc::new(DeviceFault(window));
            self.gpu.schedule(&kernel, &Hints::default(), &TensorPack::new())?;
            Err(KilnError::usage("task fault"))
        }
        fn windows(&self) -> Vec<Window> {
            Vec::new()
        }
    }

    #[test]
    fn test_failed_task_drains_queue() {
        let mut g = Graph::new("g");
        let x = add_input_node(
            &mut g,
            NodeParams::new("x"),
            TensorDescriptor::new([4], DataType::F32),
            Some(Box::new(VecAccessor::new(vec![1.0; 4]))),
        )
        .unwrap();
        let relu = ActivationInfo::new(ActivationFunction::Relu);
        let a = add_activation_node(&mut g, NodeParams::new("relu").with_target(Target::Gpu), x.into(), relu).unwrap();
        add_output_node(&mut g, NodeParams::new("out"), a.into(), None).unwrap();
        let mut session = GraphSession::with_config(g, config()).unwrap();
        let gpu = session.ctx.scheduler(Target::Gpu).unwrap();
        session.tasks[0].function = Box::new(Faulty { gpu });

        let err = session.run().unwrap_err();
        assert!(err.is_usage(), "{err}");
        assert!(err.to_string().contains("relu"), "{err}");
        // The device fault was consumed by the drain, not left for the next sync.
        session.ctx.sync_all().unwrap();
        assert_eq!(session.runs(), 0);
    }
}
