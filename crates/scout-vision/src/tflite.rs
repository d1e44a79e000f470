use anyhow::{Context, Result};
use image::{imageops::FilterType, RgbImage};
use std::{ffi::CString, os::raw::{c_char, c_int, c_void}, ptr};
use tracing::info;

use crate::postprocess::{nms_filter, postprocess_ultralytics};
use crate::{Detection, Detector, ModelConfig, ModelLoadError, ModelLoader, VisionConfig};

#[repr(C)]
struct TfLiteModel;
#[repr(C)]
struct TfLiteInterpreterOptions;
#[repr(C)]
struct TfLiteInterpreter;
#[repr(C)]
struct TfLiteTensor;

#[link(name = "tensorflowlite_c")]
extern "C" {
    fn TfLiteModelCreateFromFile(model_path: *const c_char) -> *mut TfLiteModel;
    fn TfLiteModelDelete(model: *mut TfLiteModel);

    fn TfLiteInterpreterOptionsCreate() -> *mut TfLiteInterpreterOptions;
    fn TfLiteInterpreterOptionsDelete(options: *mut TfLiteInterpreterOptions);
    fn TfLiteInterpreterOptionsSetNumThreads(options: *mut TfLiteInterpreterOptions, num_threads: c_int);

    fn TfLiteInterpreterCreate(model: *const TfLiteModel, options: *const TfLiteInterpreterOptions) -> *mut TfLiteInterpreter;
    fn TfLiteInterpreterDelete(interpreter: *mut TfLiteInterpreter);

    fn TfLiteInterpreterAllocateTensors(interpreter: *mut TfLiteInterpreter) -> c_int;
    fn TfLiteInterpreterInvoke(interpreter: *mut TfLiteInterpreter) -> c_int;

    fn TfLiteInterpreterGetInputTensor(interpreter: *mut TfLiteInterpreter, index: c_int) -> *mut TfLiteTensor;
    fn TfLiteInterpreterGetOutputTensor(interpreter: *mut TfLiteInterpreter, index: c_int) -> *const TfLiteTensor;

    fn TfLiteTensorData(tensor: *const TfLiteTensor) -> *mut c_void;
    fn TfLiteTensorByteSize(tensor: *const TfLiteTensor) -> usize;

    fn TfLiteTensorNumDims(tensor: *const TfLiteTensor) -> c_int;
    fn TfLiteTensorDim(tensor: *const TfLiteTensor, dim_index: c_int) -> c_int;
}

pub struct TfliteLoader {
    vision: VisionConfig,
}

impl TfliteLoader {
    pub fn new(vision: VisionConfig) -> Self {
        Self { vision }
    }
}

impl ModelLoader for TfliteLoader {
    fn load(&self, model: &ModelConfig) -> Result<Box<dyn Detector>, ModelLoadError> {
        if !model.path.exists() {
            return Err(ModelLoadError::WeightsMissing(model.path.clone()));
        }
        TfliteDetector::new(model, &self.vision)
            .map(|d| Box::new(d) as Box<dyn Detector>)
            .map_err(|e| ModelLoadError::Backend { name: model.name.clone(), reason: format!("{:#}", e) })
    }
}

/// Ultralytics-exported detector with u8 RGB input.
pub struct TfliteDetector {
    classes: Vec<String>,
    vision: VisionConfig,
    model: *mut TfLiteModel,
    opts: *mut TfLiteInterpreterOptions,
    interp: *mut TfLiteInterpreter,
}

// The interpreter is only touched through `&mut self`.
unsafe impl Send for TfliteDetector {}

impl TfliteDetector {
    pub fn new(cfg: &ModelConfig, vision: &VisionConfig) -> Result<Self> {
        anyhow::ensure!(!cfg.classes.is_empty(), "model {} has no classes configured", cfg.name);
        let path = cfg.path.to_string_lossy();
        let cpath = CString::new(path.as_ref())?;
        let model = unsafe { TfLiteModelCreateFromFile(cpath.as_ptr()) };
        anyhow::ensure!(!model.is_null(), "failed to load tflite model: {}", path);

        let opts = unsafe { TfLiteInterpreterOptionsCreate() };
        if opts.is_null() {
            unsafe { TfLiteModelDelete(model) };
            anyhow::bail!("failed to create tflite options");
        }
        unsafe { TfLiteInterpreterOptionsSetNumThreads(opts, vision.num_threads) };

        let interp = unsafe { TfLiteInterpreterCreate(model, opts) };
        // from here on Drop releases whatever was created
        let det = Self { classes: cfg.classes.clone(), vision: vision.clone(), model, opts, interp };
        anyhow::ensure!(!det.interp.is_null(), "failed to create tflite interpreter");

        let rc = unsafe { TfLiteInterpreterAllocateTensors(det.interp) };
        anyhow::ensure!(rc == 0, "TfLiteInterpreterAllocateTensors failed");

        info!("vision: {} ready, input[0] {:?}", cfg.name, det.input_dims()?);
        Ok(det)
    }

    fn input_dims(&self) -> Result<Vec<i32>> {
        let input = unsafe { TfLiteInterpreterGetInputTensor(self.interp, 0) };
        anyhow::ensure!(!input.is_null(), "no input tensor");
        Ok(tensor_dims(input))
    }

    fn run(&mut self, img: &RgbImage, conf_threshold: f32) -> Result<Vec<Detection>> {
        let (in_w, in_h) = (self.vision.img_w, self.vision.img_h);
        let resized = image::imageops::resize(img, in_w, in_h, FilterType::Triangle);

        let input = unsafe { TfLiteInterpreterGetInputTensor(self.interp, 0) };
        anyhow::ensure!(!input.is_null(), "no input tensor");

        let in_bytes = unsafe { TfLiteTensorByteSize(input) };
        let in_ptr = unsafe { TfLiteTensorData(input) as *mut u8 };
        anyhow::ensure!(!in_ptr.is_null(), "null input tensor data");

        let need = (in_w * in_h * 3) as usize;
        anyhow::ensure!(in_bytes >= need, "input tensor too small: {} < {}", in_bytes, need);
        unsafe { ptr::copy_nonoverlapping(resized.as_raw().as_ptr(), in_ptr, need) };

        let rc = unsafe { TfLiteInterpreterInvoke(self.interp) };
        anyhow::ensure!(rc == 0, "TfLiteInterpreterInvoke failed");

        let out = unsafe { TfLiteInterpreterGetOutputTensor(self.interp, 0) };
        anyhow::ensure!(!out.is_null(), "no output tensor 0");

        let out_dims = tensor_dims(out);
        let (num_preds, stride) = match out_dims.as_slice() {
            [1, n, s] => (*n as usize, *s as usize),
            [n, s] => (*n as usize, *s as usize),
            other => anyhow::bail!("unexpected output dims {:?}", other),
        };

        let num_classes = self.classes.len();
        anyhow::ensure!(
            stride == 5 + num_classes,
            "stride mismatch: got {}, expected {} for {} classes",
            stride, 5 + num_classes, num_classes
        );

        let out_ptr = unsafe { TfLiteTensorData(out) as *const f32 };
        anyhow::ensure!(!out_ptr.is_null(), "null output tensor data");
        let out_len = unsafe { TfLiteTensorByteSize(out) } / std::mem::size_of::<f32>();
        let raw = unsafe { std::slice::from_raw_parts(out_ptr, out_len) };

        let (w, h) = img.dimensions();
        let dets = postprocess_ultralytics(raw, num_preds, num_classes, conf_threshold)
            .into_iter()
            .map(|p| Detection {
                bbox: p.to_pixels(w, h),
                label: self.classes.get(p.class_id).cloned().unwrap_or_else(|| p.class_id.to_string()),
                confidence: p.conf,
                model: String::new(),
            })
            .collect();

        Ok(nms_filter(dets, self.vision.nms_iou_threshold, self.vision.max_detections))
    }
}

impl Detector for TfliteDetector {
    fn detect_rgb(&mut self, img: &RgbImage, conf_threshold: f32) -> Result<Vec<Detection>> {
        self.run(img, conf_threshold).context("tflite inference")
    }
}

fn tensor_dims(t: *const TfLiteTensor) -> Vec<i32> {
    unsafe {
        let nd = TfLiteTensorNumDims(t);
        let mut v = Vec::with_capacity(nd.max(0) as usize);
        for i in 0..nd { v.push(TfLiteTensorDim(t, i)); }
        v
    }
}

impl Drop for TfliteDetector {
    fn drop(&mut self) {
        unsafe {
            if !self.interp.is_null() { TfLiteInterpreterDelete(self.interp); }
            if !self.opts.is_null() { TfLiteInterpreterOptionsDelete(self.opts); }
            if !self.model.is_null() { TfLiteModelDelete(self.model); }
        }
    }
}
